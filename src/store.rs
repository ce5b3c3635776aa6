use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::debug;
use serde::{Deserialize, Serialize};
use zstd::bulk::compress;

use crate::sift::Features;

const STORE_MAGIC: [u8; 4] = *b"CSFS";
const FOOTER_MAGIC: [u8; 4] = *b"CSFE";
const STORE_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 12;
const FOOTER_SIZE: u64 = 20;
const ZSTD_LEVEL: i32 = 3;

/// 一次提取的结果：一张参考图（卡牌的某一面）的特征
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorSet {
    pub features: Features,
    pub source_image_url: String,
    pub face_index: u32,
}

/// 数据块在文件中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct BlockRef {
    offset: u64,
    size: u64,
}

/// 特征库
///
/// 文件结构：
/// - 头部：magic、版本号、描述符维度
/// - 数据块：每个 DescriptorSet 使用 bincode 序列化后 zstd 压缩
/// - 目录：card_id 到数据块位置列表的有序映射
/// - 尾部：目录偏移量、目录大小、magic
///
/// 追加时写出一个新文件替换原文件，已有数据块的位置不变。
pub struct FeatureStore {
    path: PathBuf,
    file: File,
    dim: usize,
    /// card_id → 数据块，按 card_id 排序
    directory: BTreeMap<String, Vec<BlockRef>>,
    /// 目录的起始位置，同时也是下一个数据块的写入位置
    dir_offset: u64,
}

impl FeatureStore {
    /// 创建一个空的特征库，覆盖已有文件
    pub fn create(path: impl AsRef<Path>, dim: usize) -> Result<Self> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&STORE_MAGIC)?;
        writer.write_u32::<LittleEndian>(STORE_VERSION)?;
        writer.write_u32::<LittleEndian>(dim as u32)?;
        let directory = BTreeMap::new();
        write_directory(&mut writer, &directory, HEADER_SIZE)?;
        writer.into_inner()?.sync_all()?;
        Self::open(path)
    }

    /// 以只读方式打开特征库
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("打开特征库 {} 失败", path.display()))?;
        let len = file.metadata()?.len();
        ensure!(len >= HEADER_SIZE + FOOTER_SIZE, "特征库文件过小: {}", path.display());

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact_at(&mut header, 0)?;
        ensure!(header[..4] == STORE_MAGIC, "不是特征库文件: {}", path.display());
        let version = LittleEndian::read_u32(&header[4..8]);
        ensure!(version == STORE_VERSION, "不支持的特征库版本: {version}");
        let dim = LittleEndian::read_u32(&header[8..12]) as usize;

        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact_at(&mut footer, len - FOOTER_SIZE)?;
        ensure!(footer[16..] == FOOTER_MAGIC, "特征库尾部已损坏: {}", path.display());
        let dir_offset = LittleEndian::read_u64(&footer[..8]);
        let dir_size = LittleEndian::read_u64(&footer[8..16]);
        ensure!(dir_offset + dir_size + FOOTER_SIZE == len, "特征库目录位置错误: {}", path.display());

        let mut buf = vec![0u8; dir_size as usize];
        file.read_exact_at(&mut buf, dir_offset)?;
        let directory: BTreeMap<String, Vec<BlockRef>> = bincode::deserialize(&buf)?;
        debug!("打开特征库 {}：{} 张卡牌", path.display(), directory.len());

        Ok(Self { path: path.to_path_buf(), file, dim, directory, dir_offset })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// 所有卡牌 ID，按字典序排列
    pub fn card_ids(&self) -> impl Iterator<Item = &str> {
        self.directory.keys().map(String::as_str)
    }

    pub fn contains(&self, card_id: &str) -> bool {
        self.directory.contains_key(card_id)
    }

    pub fn num_cards(&self) -> usize {
        self.directory.len()
    }

    pub fn num_sets(&self) -> usize {
        self.directory.values().map(Vec::len).sum()
    }

    /// 计算当前打开的文件的 BLAKE3 摘要
    ///
    /// 使用已打开的句柄读取，即使路径已被替换，也与之后读取的数据一致
    pub fn digest(&self) -> Result<String> {
        let len = self.file.metadata()?.len();
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; 1 << 20];
        let mut offset = 0;
        while offset < len {
            let n = buf.len().min((len - offset) as usize);
            self.file.read_exact_at(&mut buf[..n], offset)?;
            hasher.update(&buf[..n]);
            offset += n as u64;
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// 读取一张卡牌的所有特征，不存在时返回空列表
    pub fn load(&self, card_id: &str) -> Result<Vec<DescriptorSet>> {
        let Some(blocks) = self.directory.get(card_id) else {
            return Ok(vec![]);
        };
        blocks.iter().map(|block| self.read_block(*block)).collect()
    }

    fn read_block(&self, block: BlockRef) -> Result<DescriptorSet> {
        // 大部分读取是随机的单次读取，使用 pread 而不是 mmap
        let mut buf = vec![0u8; block.size as usize];
        self.file.read_exact_at(&mut buf, block.offset)?;
        let raw = zstd::decode_all(buf.as_slice())?;
        Ok(bincode::deserialize(&raw)?)
    }

    /// 按 card_id 顺序拼接所有描述符，返回描述符矩阵和每一行对应的 card_id
    ///
    /// 同一张卡牌的多组特征按写入顺序排列
    pub fn concat_descriptors(&self) -> Result<(Vec<f32>, Vec<String>)> {
        let mut descriptors = vec![];
        let mut ids = vec![];
        for card_id in self.directory.keys() {
            for set in self.load(card_id)? {
                descriptors.extend_from_slice(&set.features.descriptors);
                ids.extend(std::iter::repeat_n(card_id.clone(), set.features.len()));
            }
        }
        Ok((descriptors, ids))
    }

    /// 追加若干组特征，返回写入的数量
    ///
    /// 新文件写到同目录的临时文件中，同步后再替换原文件，写入失败时原文件不受影响。
    /// 调用方负责排序，相同的输入总是得到相同的文件内容
    pub fn append(&mut self, sets: impl IntoIterator<Item = (String, DescriptorSet)>) -> Result<usize> {
        // 先检查维度，避免写到一半才失败
        let sets = sets.into_iter().collect::<Vec<_>>();
        for (card_id, set) in &sets {
            ensure!(
                set.features.dim == self.dim,
                "{card_id} 的描述符维度不一致: {} != {}",
                set.features.dim,
                self.dim
            );
        }

        let tmp = self.tmp_path();
        let written = File::create(&tmp)
            .with_context(|| format!("创建临时文件 {} 失败", tmp.display()))
            .and_then(|file| {
                let mut writer = BufWriter::new(file);
                let written = self.write_appended(&mut writer, sets)?;
                writer.into_inner()?.sync_all()?;
                fs::rename(&tmp, &self.path)?;
                Ok(written)
            });
        let (directory, dir_offset, count) = match written {
            Ok(written) => written,
            Err(e) => {
                if let Err(rm) = fs::remove_file(&tmp) {
                    debug!("删除临时文件 {} 失败: {rm}", tmp.display());
                }
                return Err(e);
            }
        };

        self.directory = directory;
        self.dir_offset = dir_offset;
        // 重新打开只读句柄，保证之后的读取看到新内容
        self.file = File::open(&self.path)?;
        Ok(count)
    }

    fn tmp_path(&self) -> PathBuf {
        let name = self.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        self.path.with_file_name(format!(".{name}.tmp"))
    }

    /// 写出追加后的完整文件：原有的头部和数据块、新数据块、新目录和尾部
    ///
    /// 返回新的目录、目录偏移量和写入的数量，不修改 `self`
    fn write_appended<W: Write>(
        &self,
        writer: &mut W,
        sets: Vec<(String, DescriptorSet)>,
    ) -> Result<(BTreeMap<String, Vec<BlockRef>>, u64, usize)> {
        let mut prefix = vec![0u8; 1 << 20];
        let mut offset = 0;
        while offset < self.dir_offset {
            let n = prefix.len().min((self.dir_offset - offset) as usize);
            self.file.read_exact_at(&mut prefix[..n], offset)?;
            writer.write_all(&prefix[..n])?;
            offset += n as u64;
        }

        let mut directory = self.directory.clone();
        let mut count = 0;
        for (card_id, set) in sets {
            let data = compress(&bincode::serialize(&set)?, ZSTD_LEVEL)?;
            writer.write_all(&data)?;
            directory.entry(card_id).or_default().push(BlockRef { offset, size: data.len() as u64 });
            offset += data.len() as u64;
            count += 1;
        }
        write_directory(writer, &directory, offset)?;
        Ok((directory, offset, count))
    }
}

fn write_directory<W: Write>(
    writer: &mut W,
    directory: &BTreeMap<String, Vec<BlockRef>>,
    offset: u64,
) -> Result<()> {
    let data = bincode::serialize(directory)?;
    writer.write_all(&data)?;
    writer.write_u64::<LittleEndian>(offset)?;
    writer.write_u64::<LittleEndian>(data.len() as u64)?;
    writer.write_all(&FOOTER_MAGIC)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::*;
    use tempfile::TempDir;

    use super::*;
    use crate::sift::Keypoint;

    fn set(n: usize, value: f32, url: &str) -> DescriptorSet {
        let keypoints = (0..n).map(|i| Keypoint::at(i as f32, value)).collect();
        let descriptors = vec![value; n * 4];
        DescriptorSet {
            features: Features::new(keypoints, descriptors, 4),
            source_image_url: url.to_string(),
            face_index: 0,
        }
    }

    #[fixture]
    fn tmp() -> TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    fn test_create_empty(tmp: TempDir) {
        let path = tmp.path().join("features.bin");
        let store = FeatureStore::create(&path, 4).unwrap();
        assert_eq!(store.num_cards(), 0);
        assert_eq!(store.dim(), 4);
        let reopened = FeatureStore::open(&path).unwrap();
        assert_eq!(reopened.num_cards(), 0);
        assert!(reopened.load("missing").unwrap().is_empty());
    }

    #[rstest]
    fn test_append_and_reopen(tmp: TempDir) {
        let path = tmp.path().join("features.bin");
        let mut store = FeatureStore::create(&path, 4).unwrap();
        let n = store
            .append([("b".to_string(), set(2, 2.0, "b.png")), ("a".to_string(), set(3, 1.0, "a.png"))])
            .unwrap();
        assert_eq!(n, 2);
        store.append([("a".to_string(), set(1, 5.0, "a2.png"))]).unwrap();

        let store = FeatureStore::open(&path).unwrap();
        assert_eq!(store.card_ids().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(store.num_sets(), 3);
        let a = store.load("a").unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0], set(3, 1.0, "a.png"));
        assert_eq!(a[1].source_image_url, "a2.png");

        let (descriptors, ids) = store.concat_descriptors().unwrap();
        assert_eq!(ids, vec!["a", "a", "a", "a", "b", "b"]);
        assert_eq!(descriptors.len(), 6 * 4);
        assert_eq!(descriptors[12..16], [5.0; 4]);
    }

    #[rstest]
    fn test_append_is_deterministic(tmp: TempDir) {
        let p1 = tmp.path().join("1.bin");
        let p2 = tmp.path().join("2.bin");
        for p in [&p1, &p2] {
            let mut store = FeatureStore::create(p, 4).unwrap();
            store.append([("x".to_string(), set(5, 0.5, "x.png"))]).unwrap();
        }
        assert_eq!(std::fs::read(&p1).unwrap(), std::fs::read(&p2).unwrap());
    }

    #[rstest]
    fn test_dim_mismatch(tmp: TempDir) {
        let mut store = FeatureStore::create(tmp.path().join("features.bin"), 8).unwrap();
        assert!(store.append([("x".to_string(), set(1, 0.0, "x.png"))]).is_err());
    }

    #[rstest]
    fn test_truncated_file_is_rejected(tmp: TempDir) {
        let path = tmp.path().join("features.bin");
        let mut store = FeatureStore::create(&path, 4).unwrap();
        store.append([("x".to_string(), set(5, 0.5, "x.png"))]).unwrap();
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 3]).unwrap();
        assert!(FeatureStore::open(&path).is_err());
    }

    /// 写入一定字节后就失败，模拟磁盘写满
    struct FullDisk {
        remaining: usize,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.remaining == 0 {
                return Err(std::io::Error::other("no space left on device"));
            }
            let n = buf.len().min(self.remaining);
            self.remaining -= n;
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn seeded_store(path: &Path) -> FeatureStore {
        let mut store = FeatureStore::create(path, 4).unwrap();
        store
            .append([
                ("a".to_string(), set(3, 1.0, "a.png")),
                ("b".to_string(), set(2, 2.0, "b.png")),
                ("c".to_string(), set(4, 3.0, "c.png")),
            ])
            .unwrap();
        store
    }

    #[rstest]
    fn test_interrupted_append_keeps_store(tmp: TempDir) {
        let path = tmp.path().join("features.bin");
        let store = seeded_store(&path);
        let before = std::fs::read(&path).unwrap();

        let mut disk = FullDisk { remaining: before.len() };
        let sets = vec![("d".to_string(), set(50, 4.0, "d.png"))];
        assert!(store.write_appended(&mut disk, sets).is_err());

        assert_eq!(std::fs::read(&path).unwrap(), before);
        let reopened = FeatureStore::open(&path).unwrap();
        assert_eq!(reopened.card_ids().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(reopened.load("c").unwrap()[0], set(4, 3.0, "c.png"));
    }

    #[rstest]
    fn test_failed_append_keeps_store(tmp: TempDir) {
        let path = tmp.path().join("features.bin");
        let mut store = seeded_store(&path);
        // 临时文件的位置被目录占用，创建失败
        let blocker = tmp.path().join(".features.bin.tmp");
        std::fs::create_dir(&blocker).unwrap();

        assert!(store.append([("d".to_string(), set(1, 4.0, "d.png"))]).is_err());
        assert!(!store.contains("d"));
        assert_eq!(FeatureStore::open(&path).unwrap().num_cards(), 3);

        std::fs::remove_dir(&blocker).unwrap();
        store.append([("d".to_string(), set(1, 4.0, "d.png"))]).unwrap();
        let reopened = FeatureStore::open(&path).unwrap();
        assert_eq!(reopened.card_ids().collect::<Vec<_>>(), vec!["a", "b", "c", "d"]);
        assert!(!blocker.exists());
    }
}
