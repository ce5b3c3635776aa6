use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use indicatif::ProgressBar;
use log::warn;
use tokio::sync::mpsc::channel;
use tokio::task::{JoinHandle, spawn_blocking};

use crate::catalog::CardRecord;
use crate::config::BuildOptions;
use crate::fetch::ImageFetcher;
use crate::sift::FeatureExtractor;
use crate::store::DescriptorSet;
use crate::utils::pb_style;

/// 一批记录的提取结果
#[derive(Debug, Default)]
pub struct ExtractionResult {
    /// 按 `(card_id, face_index)` 排序
    pub sets: Vec<(String, DescriptorSet)>,
    /// 下载失败、解码失败或没有特征点的记录数量
    pub failed: usize,
}

/// 下载并提取一批卡牌记录的特征
///
/// 单条记录的失败只记录日志并计数，不会中断整个批次
pub async fn extract_records<F, E>(
    records: Vec<CardRecord>,
    fetcher: Arc<F>,
    extractor: Arc<E>,
    opts: &BuildOptions,
) -> Result<ExtractionResult>
where
    F: ImageFetcher,
    E: FeatureExtractor,
{
    let pb = ProgressBar::new(records.len() as u64).with_style(pb_style());
    let workers = opts.workers.max(1);

    // task1: 并发下载图片
    let (image_tx, mut image_rx) = channel::<(CardRecord, Vec<u8>)>(workers * 2);
    let task1_fetch: JoinHandle<Result<usize>> = tokio::spawn({
        let pb = pb.clone();
        let concurrency = opts.fetch_concurrency.max(1);
        async move {
            let mut failed = 0;
            let mut stream = futures::stream::iter(records)
                .map(|record| {
                    let fetcher = fetcher.clone();
                    async move {
                        let result = fetcher.fetch(&record.image_url).await;
                        (record, result)
                    }
                })
                .buffer_unordered(concurrency);
            while let Some((record, result)) = stream.next().await {
                match result {
                    Ok(data) => image_tx.send((record, data)).await?,
                    Err(e) => {
                        warn!("下载 {} 失败: {e:#}", record.image_url);
                        pb.inc(1);
                        failed += 1;
                    }
                }
            }
            Ok(failed)
        }
    });

    // task2: 在固定大小的线程池中提取特征
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("extract-{i}"))
        .build()?;
    let task2_extract = spawn_blocking({
        let pb = pb.clone();
        move || {
            let (result_tx, result_rx) = crossbeam_channel::unbounded();
            pool.in_place_scope(|s| {
                while let Some((record, data)) = image_rx.blocking_recv() {
                    let result_tx = result_tx.clone();
                    let extractor = &extractor;
                    let pb = &pb;
                    s.spawn(move |_| {
                        let features = match catch_unwind(AssertUnwindSafe(|| extractor.extract(&data))) {
                            Ok(Some(features)) => Some(features),
                            Ok(None) => {
                                warn!("{} 没有提取到特征", record.card_id);
                                None
                            }
                            Err(_) => {
                                warn!("提取 {} 时发生 panic", record.card_id);
                                None
                            }
                        };
                        pb.set_message(record.card_id.clone());
                        pb.inc(1);
                        let _ = result_tx.send((record, features));
                    });
                }
            });
            drop(result_tx);
            result_rx.into_iter().collect::<Vec<_>>()
        }
    });

    let (fetch_failed, extracted) = tokio::try_join!(task1_fetch, task2_extract)?;
    let mut result = ExtractionResult { failed: fetch_failed?, ..Default::default() };
    for (record, features) in extracted {
        match features {
            Some(features) => result.sets.push((record.card_id, DescriptorSet {
                features,
                source_image_url: record.image_url,
                face_index: record.face_index,
            })),
            None => result.failed += 1,
        }
    }
    // 提取顺序不确定，排序后写入特征库才能保证文件内容一致
    result.sets.sort_by(|(a, x), (b, y)| {
        a.cmp(b).then(x.face_index.cmp(&y.face_index)).then(x.source_image_url.cmp(&y.source_image_url))
    });

    pb.finish_with_message(format!("提取完成，成功 {}，失败 {}", result.sets.len(), result.failed));
    Ok(result)
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::*;
    use crate::sift::{Features, Keypoint};

    struct MapFetcher;

    impl ImageFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            match url {
                "missing" => bail!("404"),
                _ => Ok(url.as_bytes().to_vec()),
            }
        }
    }

    /// 内容为 `panic` 时 panic，为 `empty` 时没有特征
    struct ByteExtractor;

    impl FeatureExtractor for ByteExtractor {
        fn extract(&self, image: &[u8]) -> Option<Features> {
            match image {
                b"panic" => panic!("decoder crashed"),
                b"empty" => None,
                _ => Some(Features::new(vec![Keypoint::at(0., 0.)], vec![image.len() as f32], 1)),
            }
        }
    }

    fn record(card_id: &str, url: &str) -> CardRecord {
        CardRecord { card_id: card_id.to_string(), image_url: url.to_string(), face_index: 0 }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failures_are_skipped() {
        let records = vec![
            record("d", "dddd"),
            record("a", "missing"),
            record("b", "panic"),
            record("c", "empty"),
            record("e", "e"),
        ];
        let opts = BuildOptions { workers: 2, fetch_concurrency: 3, ..Default::default() };
        let result =
            extract_records(records, Arc::new(MapFetcher), Arc::new(ByteExtractor), &opts).await.unwrap();

        assert_eq!(result.failed, 3);
        let ids = result.sets.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["d", "e"]);
        assert_eq!(result.sets[0].1.features.descriptors, [4.0]);
        assert_eq!(result.sets[0].1.source_image_url, "dddd");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_input() {
        let opts = BuildOptions { workers: 1, ..Default::default() };
        let result =
            extract_records(vec![], Arc::new(MapFetcher), Arc::new(ByteExtractor), &opts).await.unwrap();
        assert!(result.sets.is_empty());
        assert_eq!(result.failed, 0);
    }
}
