pub mod app;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod hooks;
pub mod net;
pub mod pac;
pub mod paths;
pub mod runtime_settings;
pub mod service_config;
pub mod settings_store;
pub mod supervisor;
pub mod system_proxy;
pub mod tasks;
pub mod utils;

pub use app::AppContext;
pub use controller::{PortSet, ProxyController, ProxyMode, ProxyState};
pub use error::{CoreError, CoreResult};
pub use events::{CoreEvent, EventBus, Topic};
pub use hooks::{HookRegistry, Phase};
pub use service_config::ServiceConfig;
pub use supervisor::{ProcessSupervisor, RestartPolicy};
