use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

/// key: listing-directory -> listing ownership lookups owned by the marketplace
#[async_trait]
pub trait ListingDirectory: Send + Sync {
    /// Seller that owns the listing, `None` for unknown listings.
    async fn listing_owner(&self, listing_id: Uuid) -> Result<Option<Uuid>>;
}

#[derive(Clone)]
pub struct PgListingDirectory {
    pool: PgPool,
}

impl PgListingDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ListingDirectory for PgListingDirectory {
    async fn listing_owner(&self, listing_id: Uuid) -> Result<Option<Uuid>> {
        let owner = sqlx::query_scalar::<_, Uuid>("SELECT seller_id FROM listings WHERE id = $1")
            .bind(listing_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(owner)
    }
}
