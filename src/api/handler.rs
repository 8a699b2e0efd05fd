use crate::api::schemas::{action_catalog, ActionDescriptor};
use crate::config::Config;
use crate::engine::validate_container_name;
use crate::error::AppError;
use crate::lifecycle::events::EventHub;
use crate::lifecycle::StreamManager;
use crate::panel::containers::{ContainerActionParams, ContainerManager, ContainerNameParams, ListContainersParams};
use crate::panel::images::{ImageIdParams, ImageManager};
use crate::panel::manage::{
    FollowLogsParams, ManageModal, OpenManageParams, OpenTerminalParams, RunCommandParams, SwitchTabParams,
};
use crate::panel::EngineContext;
use crate::runner::CommandRunner;
use crate::utils::audit_logger::AuditLogger;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Actions polled often enough that auditing them would drown everything else.
const UNAUDITED_ACTIONS: &[&str] = &["list_actions", "read_events", "manage_status"];

#[derive(Debug, Default, Deserialize)]
struct ReadEventsParams {
    since: Option<u64>,
}

pub struct AppManagers {
    config: Arc<Config>,
    events: Arc<EventHub>,
    containers: Arc<ContainerManager>,
    images: Arc<ImageManager>,
    modal: Arc<ManageModal>,
}

impl AppManagers {
    pub fn new(config: Arc<Config>, runner: Arc<dyn CommandRunner>) -> Self {
        let ctx = EngineContext::new(runner.clone(), &config);
        let events = Arc::new(EventHub::new(config.event_buffer_size));
        let streams = StreamManager::new(runner, events.clone());

        Self {
            containers: Arc::new(ContainerManager::new(ctx.clone(), config.default_sort)),
            images: Arc::new(ImageManager::new(ctx.clone())),
            modal: Arc::new(ManageModal::new(ctx, streams, config.clone())),
            events,
            config,
        }
    }
}

/// Dispatches named actions with JSON params. Shared by both transports.
pub struct PanelHandler {
    managers: Arc<AppManagers>,
    audit: AuditLogger,
}

impl std::fmt::Debug for PanelHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelHandler").field("audit", &self.audit).finish_non_exhaustive()
    }
}

impl PanelHandler {
    pub fn new(config: Arc<Config>, runner: Arc<dyn CommandRunner>) -> Self {
        let audit = AuditLogger::new(config.audit_log_file.clone(), config.audit_log_max_size_bytes);
        Self {
            managers: Arc::new(AppManagers::new(config, runner)),
            audit,
        }
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.managers.events
    }

    pub fn list_actions(&self) -> Vec<ActionDescriptor> {
        action_catalog(self.managers.config.follow_log_tail, &self.managers.config.default_shell)
    }

    /// Stops every running stream. Called when the transport goes away.
    pub async fn shutdown(&self) {
        let status = self.managers.modal.close().await;
        debug!(was_open = status.stopped, "Handler shut down");
    }

    #[instrument(skip(self, params), fields(action = %action))]
    pub async fn dispatch(&self, action: &str, params: Map<String, Value>) -> Result<Value, AppError> {
        info!("Handling action: {}", action);
        if !UNAUDITED_ACTIONS.contains(&action) {
            self.audit.log_action(action, &Value::Object(params.clone())).await;
        }

        macro_rules! parse_params {
            ($param_type:ty) => {
                serde_json::from_value::<$param_type>(Value::Object(params))
                    .map_err(|e| AppError::InvalidInputArgument(e.to_string()))?
            };
        }

        macro_rules! handle_action {
            ($manager_field:ident . $method:ident :: <$param_type:ty> ()) => {{
                let params = parse_params!($param_type);
                let result = self.managers.$manager_field.$method(&params).await?;
                Ok(serde_json::to_value(result)?)
            }};
            ($manager_field:ident . $method:ident ()) => {{
                let result = self.managers.$manager_field.$method().await?;
                Ok(serde_json::to_value(result)?)
            }};
        }

        match action {
            // Meta
            "list_actions" => Ok(serde_json::to_value(self.list_actions())?),
            "get_config" => Ok(serde_json::to_value(self.managers.config.as_ref())?),
            "read_events" => {
                let params = parse_params!(ReadEventsParams);
                Ok(serde_json::to_value(self.managers.events.read_since(params.since.unwrap_or(0)))?)
            }
            // Containers
            "check_engine" => handle_action!(containers.check_engine()),
            "list_containers" => handle_action!(containers.list_containers::<ListContainersParams>()),
            "container_action" => handle_action!(containers.container_action::<ContainerActionParams>()),
            "delete_container" => {
                let params = parse_params!(ContainerNameParams);
                let result = self.managers.containers.delete_container(&params).await?;
                self.managers
                    .modal
                    .on_container_deleted(validate_container_name(&params.name)?)
                    .await;
                Ok(serde_json::to_value(result)?)
            }
            "inspect_container" => handle_action!(containers.inspect_container::<ContainerNameParams>()),
            // Images
            "list_images" => handle_action!(images.list_images()),
            "delete_image" => handle_action!(images.delete_image::<ImageIdParams>()),
            "prune_images" => handle_action!(images.prune_images()),
            // Manage modal
            "open_manage" => handle_action!(modal.open::<OpenManageParams>()),
            "switch_tab" => handle_action!(modal.switch_tab::<SwitchTabParams>()),
            "follow_logs" => handle_action!(modal.follow_logs::<FollowLogsParams>()),
            "stop_logs" => handle_action!(modal.stop_logs()),
            "open_terminal" => handle_action!(modal.open_terminal::<OpenTerminalParams>()),
            "run_command" => handle_action!(modal.run_command::<RunCommandParams>()),
            "close_terminal" => handle_action!(modal.close_terminal()),
            "close_manage" => Ok(serde_json::to_value(self.managers.modal.close().await)?),
            "manage_status" => Ok(serde_json::to_value(self.managers.modal.status())?),

            _ => {
                error!("Unknown action called: {}", action);
                Err(AppError::UnknownAction(action.to_string()))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::PanelHandler;
    use crate::panel::test_config;
    use crate::runner::fake::FakeRunner;
    use std::sync::Arc;

    pub fn handler() -> (Arc<FakeRunner>, Arc<PanelHandler>) {
        let runner = Arc::new(FakeRunner::new());
        let handler = Arc::new(PanelHandler::new(Arc::new(test_config()), runner.clone()));
        (runner, handler)
    }
}
