use super::EngineContext;
use crate::engine::parse::{
    build_name_index, filter_rows, parse_container_list, parse_inspect, parse_stats, sort_rows, ContainerDetails,
    ContainerRow, ContainerStats, SortKey,
};
use crate::engine::{validate_container_name, ContainerAction};
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Default, Deserialize)]
pub struct ListContainersParams {
    pub sort: Option<SortKey>,
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContainerActionParams {
    pub name: String,
    pub action: ContainerAction,
}

#[derive(Debug, Deserialize)]
pub struct ContainerNameParams {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ListContainersResult {
    pub containers: Vec<ContainerRow>,
    /// Containers known to the engine before the search filter was applied.
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub available: bool,
    pub binary: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ContainerManager {
    ctx: EngineContext,
    default_sort: SortKey,
}

impl ContainerManager {
    pub fn new(ctx: EngineContext, default_sort: SortKey) -> Self {
        Self { ctx, default_sort }
    }

    #[instrument(skip(self))]
    pub async fn check_engine(&self) -> Result<EngineStatus, AppError> {
        let binary = self.ctx.engine.binary().to_string();
        match self.ctx.output(self.ctx.engine.info()).await {
            Ok(_) => Ok(EngineStatus {
                available: true,
                message: format!("{} is reachable", binary),
                binary,
            }),
            Err(e) => {
                warn!(error = %e, "Container engine is not reachable");
                Ok(EngineStatus {
                    available: false,
                    message: e.to_string(),
                    binary,
                })
            }
        }
    }

    /// Stats keyed by container name; any failure just means no stats.
    async fn load_stats(&self) -> HashMap<String, ContainerStats> {
        let ids = match self.ctx.output(self.ctx.engine.container_ids()).await {
            Ok(out) => out,
            Err(e) => {
                debug!(error = %e, "Skipping stats: container id listing failed");
                return HashMap::new();
            }
        };
        let index = build_name_index(&ids);
        match self.ctx.output(self.ctx.engine.stats()).await {
            Ok(out) => parse_stats(&out, &index),
            Err(e) => {
                debug!(error = %e, "Skipping stats: stats command failed");
                HashMap::new()
            }
        }
    }

    #[instrument(skip(self, params), fields(sort = ?params.sort))]
    pub async fn list_containers(&self, params: &ListContainersParams) -> Result<ListContainersResult, AppError> {
        let (listing, mut stats) = tokio::join!(self.ctx.output(self.ctx.engine.list_containers()), self.load_stats());
        let mut rows = parse_container_list(&listing?);
        for row in rows.iter_mut().filter(|r| r.running) {
            row.stats = stats.remove(&row.name);
        }
        let total = rows.len();
        sort_rows(&mut rows, params.sort.unwrap_or(self.default_sort));
        let containers = filter_rows(rows, params.search.as_deref().unwrap_or_default());
        debug!(total, shown = containers.len(), "Listed containers");
        Ok(ListContainersResult { containers, total })
    }

    #[instrument(skip(self, params), fields(name = %params.name, action = %params.action))]
    pub async fn container_action(&self, params: &ContainerActionParams) -> Result<ActionResult, AppError> {
        let name = validate_container_name(&params.name)?;
        info!("{} {}…", params.action.progress_label(), name);
        self.ctx
            .output(self.ctx.engine.container_action(params.action, name))
            .await
            .map_err(|e| AppError::EngineCommandError(format!("Failed to {} {}: {}", params.action, name, e)))?;
        Ok(ActionResult {
            success: true,
            message: format!("{} {}", params.action.past_tense(), name),
        })
    }

    #[instrument(skip(self, params), fields(name = %params.name))]
    pub async fn delete_container(&self, params: &ContainerNameParams) -> Result<ActionResult, AppError> {
        let name = validate_container_name(&params.name)?;
        self.ctx
            .output(self.ctx.engine.remove_container(name))
            .await
            .map_err(|e| AppError::EngineCommandError(format!("Delete failed: {}", e)))?;
        info!("Deleted container");
        Ok(ActionResult {
            success: true,
            message: format!("Deleted {}", name),
        })
    }

    #[instrument(skip(self, params), fields(name = %params.name))]
    pub async fn inspect_container(&self, params: &ContainerNameParams) -> Result<ContainerDetails, AppError> {
        let name = validate_container_name(&params.name)?;
        let out = self.ctx.output(self.ctx.engine.inspect(name)).await?;
        match parse_inspect(&out) {
            Ok(details) => Ok(details),
            Err(AppError::ParseError(reason)) => {
                debug!(reason = %reason, "Retrying inspect with engine-formatted JSON");
                let out = self.ctx.output(self.ctx.engine.inspect_json(name)).await?;
                parse_inspect(&out)
            }
            Err(e) => Err(e),
        }
    }
}
