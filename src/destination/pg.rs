use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgConnection, Row};
use std::collections::HashMap;
use tracing::{instrument, warn};

use super::{
    new_id, CatalogStore, CategoryCreate, CategoryFilter, DestCategory, DestProduct, DestVariant,
    Metadata, Page, Price, ProductFilter, ProductInput, ProductStatus, StoreContext, VariantInput,
    WriteFailure, WriteReport,
};
use crate::error::StoreError;
use crate::util::db::Db;

const CATEGORY_WHERE: &str = "WHERE (NOT $1 AND NOT $2) \
     OR ($1 AND handle = ANY($3)) \
     OR ($2 AND metadata->>$4 = ANY($5))";

const PRODUCT_WHERE: &str = "WHERE (NOT $1 OR metadata->>$2 = ANY($3))";

/// Postgres-backed destination store.
#[derive(Clone)]
pub struct PgCatalogStore {
    db: Db,
}

impl PgCatalogStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn create_product(&self, p: &ProductInput) -> Result<String, sqlx::Error> {
        let id = new_id("prod");
        let mut tx = self.db.pool.begin().await?;
        sqlx::query(
            "INSERT INTO product (id, external_id, title, subtitle, description, status, options, metadata, sales_channel_ids)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .persistent(false)
        .bind(&id)
        .bind(&p.external_id)
        .bind(&p.title)
        .bind(&p.subtitle)
        .bind(&p.description)
        .bind(p.status.as_str())
        .bind(to_json(&p.options))
        .bind(Value::Object(p.metadata.clone()))
        .bind(&p.sales_channel_ids)
        .execute(&mut *tx)
        .await?;
        replace_images(&mut tx, &id, p).await?;
        for v in &p.variants {
            write_variant(&mut tx, &id, v).await?;
        }
        replace_category_links(&mut tx, &id, &p.category_ids).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn update_product(&self, p: &ProductInput) -> Result<String, sqlx::Error> {
        let Some(id) = p.id.clone() else {
            return Err(sqlx::Error::RowNotFound);
        };
        let mut tx = self.db.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE product SET external_id = $2, title = $3, subtitle = $4, description = $5,
                 status = $6, options = $7, metadata = $8,
                 sales_channel_ids = ARRAY(SELECT DISTINCT unnest(sales_channel_ids || $9::text[])),
                 updated_at = now()
             WHERE id = $1",
        )
        .persistent(false)
        .bind(&id)
        .bind(&p.external_id)
        .bind(&p.title)
        .bind(&p.subtitle)
        .bind(&p.description)
        .bind(p.status.as_str())
        .bind(to_json(&p.options))
        .bind(Value::Object(p.metadata.clone()))
        .bind(&p.sales_channel_ids)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        replace_images(&mut tx, &id, p).await?;
        for v in &p.variants {
            write_variant(&mut tx, &id, v).await?;
        }
        replace_category_links(&mut tx, &id, &p.category_ids).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn create_category(&self, c: &CategoryCreate) -> Result<String, sqlx::Error> {
        let id = new_id("pcat");
        sqlx::query(
            "INSERT INTO product_category (id, name, handle, description, is_active, metadata)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .persistent(false)
        .bind(&id)
        .bind(&c.name)
        .bind(&c.handle)
        .bind(&c.description)
        .bind(c.is_active)
        .bind(Value::Object(c.metadata.clone()))
        .execute(&self.db.pool)
        .await?;
        Ok(id)
    }

    async fn load_variants(
        &self,
        product_ids: &[String],
    ) -> Result<HashMap<String, Vec<DestVariant>>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, product_id, title, sku, metadata FROM product_variant
             WHERE product_id = ANY($1) ORDER BY created_at, id",
        )
        .persistent(false)
        .bind(product_ids)
        .fetch_all(&self.db.pool)
        .await?;
        let variant_ids: Vec<String> = rows
            .iter()
            .filter_map(|r| r.try_get::<String, _>("id").ok())
            .collect();

        let mut prices: HashMap<String, Vec<Price>> = HashMap::new();
        for r in sqlx::query(
            "SELECT variant_id, currency_code, amount FROM product_variant_price
             WHERE variant_id = ANY($1) ORDER BY currency_code",
        )
        .persistent(false)
        .bind(&variant_ids)
        .fetch_all(&self.db.pool)
        .await?
        {
            prices
                .entry(r.try_get("variant_id")?)
                .or_default()
                .push(Price {
                    currency_code: r.try_get("currency_code")?,
                    amount: r.try_get::<BigDecimal, _>("amount")?,
                });
        }

        let mut out: HashMap<String, Vec<DestVariant>> = HashMap::new();
        for r in rows {
            let id: String = r.try_get("id")?;
            out.entry(r.try_get("product_id")?)
                .or_default()
                .push(DestVariant {
                    prices: prices.remove(&id).unwrap_or_default(),
                    id,
                    title: r.try_get("title")?,
                    sku: r.try_get("sku")?,
                    metadata: as_metadata(r.try_get("metadata")?),
                });
        }
        Ok(out)
    }

    async fn load_category_links(
        &self,
        product_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, sqlx::Error> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for r in sqlx::query(
            "SELECT product_id, product_category_id FROM product_category_product
             WHERE product_id = ANY($1) ORDER BY product_category_id",
        )
        .persistent(false)
        .bind(product_ids)
        .fetch_all(&self.db.pool)
        .await?
        {
            out.entry(r.try_get("product_id")?)
                .or_default()
                .push(r.try_get("product_category_id")?);
        }
        Ok(out)
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn as_metadata(value: Option<Value>) -> Metadata {
    match value {
        Some(Value::Object(map)) => map,
        _ => Metadata::new(),
    }
}

fn page_bounds(skip: usize, take: Option<usize>) -> (i64, Option<i64>) {
    (skip as i64, take.map(|t| t as i64))
}

async fn replace_images(
    conn: &mut PgConnection,
    product_id: &str,
    p: &ProductInput,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM product_image WHERE product_id = $1")
        .persistent(false)
        .bind(product_id)
        .execute(&mut *conn)
        .await?;
    for (rank, image) in p.images.iter().enumerate() {
        sqlx::query(
            "INSERT INTO product_image (id, product_id, url, rank, metadata) VALUES ($1, $2, $3, $4, $5)",
        )
        .persistent(false)
        .bind(new_id("img"))
        .bind(product_id)
        .bind(&image.url)
        .bind(rank as i32)
        .bind(Value::Object(image.metadata.clone()))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn write_variant(
    conn: &mut PgConnection,
    product_id: &str,
    v: &VariantInput,
) -> Result<(), sqlx::Error> {
    let variant_id = match &v.id {
        Some(id) => {
            sqlx::query(
                "UPDATE product_variant SET title = $3, sku = $4, manage_inventory = $5, material = $6,
                     options = $7, metadata = $8, updated_at = now()
                 WHERE id = $1 AND product_id = $2",
            )
            .persistent(false)
            .bind(id)
            .bind(product_id)
            .bind(&v.title)
            .bind(&v.sku)
            .bind(v.manage_inventory)
            .bind(&v.material)
            .bind(to_json(&v.options))
            .bind(Value::Object(v.metadata.clone()))
            .execute(&mut *conn)
            .await?;
            id.clone()
        }
        None => {
            let id = new_id("variant");
            sqlx::query(
                "INSERT INTO product_variant (id, product_id, title, sku, manage_inventory, material, options, metadata)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .persistent(false)
            .bind(&id)
            .bind(product_id)
            .bind(&v.title)
            .bind(&v.sku)
            .bind(v.manage_inventory)
            .bind(&v.material)
            .bind(to_json(&v.options))
            .bind(Value::Object(v.metadata.clone()))
            .execute(&mut *conn)
            .await?;
            id
        }
    };
    for price in &v.prices {
        sqlx::query(
            "INSERT INTO product_variant_price (variant_id, currency_code, amount) VALUES ($1, $2, $3)
             ON CONFLICT (variant_id, currency_code) DO UPDATE SET amount = EXCLUDED.amount",
        )
        .persistent(false)
        .bind(&variant_id)
        .bind(&price.currency_code)
        .bind(&price.amount)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn replace_category_links(
    conn: &mut PgConnection,
    product_id: &str,
    category_ids: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "DELETE FROM product_category_product
         WHERE product_id = $1 AND NOT (product_category_id = ANY($2))",
    )
    .persistent(false)
    .bind(product_id)
    .bind(category_ids)
    .execute(&mut *conn)
    .await?;
    // Only categories that still exist; a stale id must not fail the product.
    sqlx::query(
        "INSERT INTO product_category_product (product_id, product_category_id)
         SELECT $1, id FROM product_category WHERE id = ANY($2)
         ON CONFLICT DO NOTHING",
    )
    .persistent(false)
    .bind(product_id)
    .bind(category_ids)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn store_context(&self) -> Result<StoreContext, StoreError> {
        let row = sqlx::query(
            "SELECT default_sales_channel_id, supported_currencies FROM store ORDER BY created_at LIMIT 1",
        )
        .persistent(false)
        .fetch_optional(&self.db.pool)
        .await?;
        let Some(row) = row else {
            warn!("destination has no store row; no currencies or sales channel available");
            return Ok(StoreContext::default());
        };
        Ok(StoreContext {
            default_sales_channel_id: row.try_get("default_sales_channel_id")?,
            supported_currencies: row.try_get("supported_currencies")?,
        })
    }

    #[instrument(skip(self))]
    async fn find_categories(
        &self,
        filter: &CategoryFilter,
    ) -> Result<Page<DestCategory>, StoreError> {
        let handles = filter.handles.clone().unwrap_or_default();
        let (meta_key, meta_values) = filter
            .metadata
            .as_ref()
            .map(|m| (m.key.clone(), m.values.clone()))
            .unwrap_or_else(|| ("external_id".to_string(), Vec::new()));
        let (offset, limit) = page_bounds(filter.skip, filter.take);

        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM product_category {CATEGORY_WHERE}"
        ))
        .persistent(false)
        .bind(filter.handles.is_some())
        .bind(filter.metadata.is_some())
        .bind(&handles)
        .bind(&meta_key)
        .bind(&meta_values)
        .fetch_one(&self.db.pool)
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT id, name, handle, metadata FROM product_category {CATEGORY_WHERE}
             ORDER BY created_at, id OFFSET $6 LIMIT $7"
        ))
        .persistent(false)
        .bind(filter.handles.is_some())
        .bind(filter.metadata.is_some())
        .bind(&handles)
        .bind(&meta_key)
        .bind(&meta_values)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.db.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for r in rows {
            items.push(DestCategory {
                id: r.try_get("id")?,
                name: r.try_get("name")?,
                handle: r.try_get("handle")?,
                metadata: as_metadata(r.try_get("metadata")?),
            });
        }
        Ok(Page {
            items,
            count: count as usize,
        })
    }

    #[instrument(skip(self))]
    async fn find_products(&self, filter: &ProductFilter) -> Result<Page<DestProduct>, StoreError> {
        let (meta_key, meta_values) = filter
            .metadata
            .as_ref()
            .map(|m| (m.key.clone(), m.values.clone()))
            .unwrap_or_else(|| ("external_id".to_string(), Vec::new()));
        let (offset, limit) = page_bounds(filter.skip, filter.take);

        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM product {PRODUCT_WHERE}"))
                .persistent(false)
                .bind(filter.metadata.is_some())
                .bind(&meta_key)
                .bind(&meta_values)
                .fetch_one(&self.db.pool)
                .await?;

        let rows = sqlx::query(&format!(
            "SELECT id, external_id, title, status, metadata FROM product {PRODUCT_WHERE}
             ORDER BY created_at, id OFFSET $4 LIMIT $5"
        ))
        .persistent(false)
        .bind(filter.metadata.is_some())
        .bind(&meta_key)
        .bind(&meta_values)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.db.pool)
        .await?;

        let ids: Vec<String> = rows
            .iter()
            .filter_map(|r| r.try_get::<String, _>("id").ok())
            .collect();
        let mut variants = self.load_variants(&ids).await?;
        let mut links = self.load_category_links(&ids).await?;

        let mut items = Vec::with_capacity(rows.len());
        for r in rows {
            let id: String = r.try_get("id")?;
            let status: String = r.try_get("status")?;
            items.push(DestProduct {
                variants: variants.remove(&id).unwrap_or_default(),
                category_ids: links.remove(&id).unwrap_or_default(),
                external_id: r.try_get("external_id")?,
                title: r.try_get("title")?,
                status: ProductStatus::parse(&status),
                metadata: as_metadata(r.try_get("metadata")?),
                id,
            });
        }
        Ok(Page {
            items,
            count: count as usize,
        })
    }

    #[instrument(skip(self, batch), fields(items = batch.len()))]
    async fn create_categories(&self, batch: &[CategoryCreate]) -> Result<WriteReport, StoreError> {
        let mut report = WriteReport::default();
        for c in batch {
            match self.create_category(c).await {
                Ok(id) => report.written.push(id),
                Err(err) => {
                    warn!(handle = %c.handle, error = %err, "category create failed");
                    report.failed.push(WriteFailure {
                        key: c.handle.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    #[instrument(skip(self, batch), fields(items = batch.len()))]
    async fn create_products(&self, batch: &[ProductInput]) -> Result<WriteReport, StoreError> {
        let mut report = WriteReport::default();
        for p in batch {
            match self.create_product(p).await {
                Ok(id) => report.written.push(id),
                Err(err) => {
                    warn!(external_id = %p.external_id, error = %err, "product create failed");
                    report.failed.push(WriteFailure {
                        key: p.external_id.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    #[instrument(skip(self, batch), fields(items = batch.len()))]
    async fn update_products(&self, batch: &[ProductInput]) -> Result<WriteReport, StoreError> {
        let mut report = WriteReport::default();
        for p in batch {
            match self.update_product(p).await {
                Ok(id) => report.written.push(id),
                Err(err) => {
                    warn!(external_id = %p.external_id, error = %err, "product update failed");
                    report.failed.push(WriteFailure {
                        key: p.external_id.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }
}
