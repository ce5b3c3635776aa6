use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::RwLock;

use anyhow::Result;
use log::warn;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use utoipa::ToSchema;

/// 卡牌目录中的一条记录，一张卡牌的一个面对应一条
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardRecord {
    pub card_id: String,
    pub image_url: String,
    pub face_index: u32,
}

/// 识别结果中展示给用户的卡牌信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema, FromRow)]
pub struct CardMetadata {
    pub card_id: String,
    pub name: String,
    pub set_code: Option<String>,
    pub set_name: Option<String>,
    pub collector_number: Option<String>,
    /// 美元价格，保持目录中的原始字符串
    pub price_usd: Option<String>,
    pub image_uri: Option<String>,
}

/// 卡牌目录，由外部导入程序维护，这里只读
pub trait CardCatalog: Send + Sync + 'static {
    /// 返回所有需要识别的卡牌记录，按 card_id 排序
    fn eligible_records(&self) -> impl Future<Output = Result<Vec<CardRecord>>> + Send;

    /// 查询卡牌信息，卡牌已从目录中删除时返回 `None`
    fn card_metadata(
        &self,
        card_id: &str,
    ) -> impl Future<Output = Result<Option<CardMetadata>>> + Send;
}

/// 查询卡牌信息，失败时记录日志并返回 `None`
///
/// 卡牌信息只用于丰富识别结果，查询失败不影响识别本身
pub async fn lookup_metadata<C: CardCatalog>(catalog: &C, card_id: &str) -> Option<CardMetadata> {
    match catalog.card_metadata(card_id).await {
        Ok(card) => card,
        Err(e) => {
            warn!("查询 {card_id} 的卡牌信息失败: {e:#}");
            None
        }
    }
}

const ELIGIBLE_SQL: &str = r#"
    SELECT id AS card_id,
           COALESCE(json_extract(image_uris, '$.png'), json_extract(image_uris, '$.large')) AS image_url,
           0 AS face_index
    FROM cards
    WHERE layout NOT IN ('art_series', 'scheme', 'plane', 'phenomenon')
      AND EXISTS (SELECT 1 FROM json_each(cards.games) WHERE json_each.value = 'paper')
      AND lang = 'en'
      AND digital = 0
      AND (promo IS NULL OR promo = 0)
      AND image_uris IS NOT NULL
      AND COALESCE(json_extract(image_uris, '$.png'), json_extract(image_uris, '$.large')) IS NOT NULL
    ORDER BY id
"#;

const METADATA_SQL: &str = r#"
    SELECT id AS card_id,
           name,
           "set" AS set_code,
           set_name,
           collector_number,
           CAST(json_extract(prices, '$.usd') AS TEXT) AS price_usd,
           COALESCE(json_extract(image_uris, '$.normal'), json_extract(image_uris, '$.large')) AS image_uri
    FROM cards
    WHERE id = ?
"#;

#[derive(FromRow)]
struct CardRecordRow {
    card_id: String,
    image_url: String,
    face_index: i64,
}

/// 基于 sqlite 的卡牌目录
///
/// `cards` 表的结构与目录导入程序一致，`games`、`image_uris`、`prices` 为 JSON 文本
#[derive(Clone)]
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    /// 以只读方式打开目录数据库
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl CardCatalog for SqliteCatalog {
    async fn eligible_records(&self) -> Result<Vec<CardRecord>> {
        let rows = sqlx::query_as::<_, CardRecordRow>(ELIGIBLE_SQL).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| CardRecord {
                card_id: row.card_id,
                image_url: row.image_url,
                face_index: row.face_index as u32,
            })
            .collect())
    }

    async fn card_metadata(&self, card_id: &str) -> Result<Option<CardMetadata>> {
        Ok(sqlx::query_as::<_, CardMetadata>(METADATA_SQL)
            .bind(card_id)
            .fetch_optional(&self.pool)
            .await?)
    }
}

/// 内存中的卡牌目录，记录可以随时追加
#[derive(Default)]
pub struct MemoryCatalog {
    records: RwLock<Vec<CardRecord>>,
    metadata: RwLock<HashMap<String, CardMetadata>>,
}

impl MemoryCatalog {
    pub fn new(records: Vec<CardRecord>) -> Self {
        Self { records: RwLock::new(records), metadata: RwLock::default() }
    }

    pub fn push(&self, record: CardRecord) {
        self.records.write().unwrap_or_else(|e| e.into_inner()).push(record);
    }

    pub fn insert_metadata(&self, metadata: CardMetadata) {
        self.metadata
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(metadata.card_id.clone(), metadata);
    }
}

impl CardCatalog for MemoryCatalog {
    async fn eligible_records(&self) -> Result<Vec<CardRecord>> {
        let mut records = self.records.read().unwrap_or_else(|e| e.into_inner()).clone();
        records.sort_by(|a, b| a.card_id.cmp(&b.card_id).then(a.face_index.cmp(&b.face_index)));
        Ok(records)
    }

    async fn card_metadata(&self, card_id: &str) -> Result<Option<CardMetadata>> {
        Ok(self.metadata.read().unwrap_or_else(|e| e.into_inner()).get(card_id).cloned())
    }
}
