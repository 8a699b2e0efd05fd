use super::containers::ActionResult;
use super::EngineContext;
use crate::engine::parse::{parse_image_usage, removable_images, short_image_id, ImageRow};
use crate::engine::validate_image_ref;
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, instrument};

#[derive(Debug, Deserialize)]
pub struct ImageIdParams {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct ListImagesResult {
    pub images: Vec<ImageRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug)]
pub struct ImageManager {
    ctx: EngineContext,
}

impl ImageManager {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    async fn used_images(&self) -> HashSet<String> {
        match self.ctx.output(self.ctx.engine.image_usage()).await {
            Ok(out) => parse_image_usage(&out),
            Err(e) => {
                debug!(error = %e, "Image usage query failed; treating every image as unused");
                HashSet::new()
            }
        }
    }

    /// Images no container uses, the only ones the panel offers to delete.
    #[instrument(skip(self))]
    pub async fn list_images(&self) -> Result<ListImagesResult, AppError> {
        let (listing, used) = tokio::join!(self.ctx.output(self.ctx.engine.images()), self.used_images());
        let listing = listing?;
        let images = removable_images(&listing, &used);
        let message = if !images.is_empty() {
            None
        } else if listing.trim().is_empty() {
            Some("No images found.".to_string())
        } else {
            Some("All images are currently in use by containers.".to_string())
        };
        debug!(removable = images.len(), "Listed images");
        Ok(ListImagesResult { images, message })
    }

    #[instrument(skip(self, params), fields(id = %params.id))]
    pub async fn delete_image(&self, params: &ImageIdParams) -> Result<ActionResult, AppError> {
        let id = validate_image_ref(&params.id)?;
        self.ctx
            .output(self.ctx.engine.remove_image(id))
            .await
            .map_err(|e| AppError::EngineCommandError(format!("Delete failed: {}", e)))?;
        info!("Deleted image");
        Ok(ActionResult {
            success: true,
            message: format!("Deleted {}", short_image_id(id)),
        })
    }

    #[instrument(skip(self))]
    pub async fn prune_images(&self) -> Result<ActionResult, AppError> {
        let out = self
            .ctx
            .output(self.ctx.engine.prune_images())
            .await
            .map_err(|e| AppError::EngineCommandError(format!("Prune failed: {}", e)))?;
        let summary = out
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(str::trim)
            .unwrap_or("Nothing to prune")
            .to_string();
        info!(summary = %summary, "Pruned unused images");
        Ok(ActionResult {
            success: true,
            message: summary,
        })
    }
}
