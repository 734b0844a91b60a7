use crate::{cache::CacheBackend, entities::product, errors::ServiceError};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Co-purchase recommendations kept as one scored set per product
#[derive(Clone)]
pub struct Recommender {
    db: Arc<DatabaseConnection>,
    cache: Arc<dyn CacheBackend>,
}

impl Recommender {
    pub fn new(db: Arc<DatabaseConnection>, cache: Arc<dyn CacheBackend>) -> Self {
        Self { db, cache }
    }

    fn key(product_id: &Uuid) -> String {
        format!("product:{}:purchased_with", product_id)
    }

    /// Counts every other product of a paid order as bought together with each product.
    #[instrument(skip(self))]
    pub async fn products_bought(&self, product_ids: &[Uuid]) -> Result<(), ServiceError> {
        for a in product_ids {
            for b in product_ids.iter().filter(|b| *b != a) {
                self.cache
                    .incr_score(&Self::key(a), &b.to_string(), 1.0)
                    .await?;
            }
        }
        Ok(())
    }

    /// Products most often bought with `product_ids`, best first, never one of the inputs.
    #[instrument(skip(self))]
    pub async fn suggest_products_for(
        &self,
        product_ids: &[Uuid],
        max_results: usize,
    ) -> Result<Vec<product::Model>, ServiceError> {
        if product_ids.is_empty() || max_results == 0 {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = product_ids.iter().map(Self::key).collect();
        let ranked: Vec<Uuid> = self
            .cache
            .union_by_score(&keys)
            .await?
            .iter()
            .filter_map(|member| Uuid::parse_str(member).ok())
            .filter(|id| !product_ids.contains(id))
            .take(max_results)
            .collect();
        debug!(inputs = product_ids.len(), suggested = ranked.len(), "recommendations ranked");

        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        let mut products: HashMap<Uuid, product::Model> = product::Entity::find()
            .filter(product::Column::Id.is_in(ranked.clone()))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        Ok(ranked
            .iter()
            .filter_map(|id| products.remove(id))
            .collect())
    }
}
