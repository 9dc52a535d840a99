//! # Orchestration
//!
//! The broker verbs and the pieces they are built from.
//!
//! ## Components
//!
//! - **Broker**: provisioning protocol verbs over storage and the provider registry
//! - **MutationGate**: serializes provision, deprovision, bind and unbind
//! - **ActionRegistry**: extension actions (backups, flush, stats, restart) and their routes
//! - **Types**: request and response shapes of every verb

pub mod actions;
pub mod broker;
pub mod gate;
pub mod types;

pub use actions::{ActionKind, ActionRegistry, ExtensionAction, ExtensionApi, HttpMethod};
pub use broker::{Broker, APP_TAG, BINDING_TAG};
pub use gate::{GatePass, MutationGate};
pub use types::{
    ActionResponse, BindRequest, BindResponse, CatalogResponse, DeprovisionResponse,
    GetBindingResponse, LastOperationResponse, OperationState, ProvisionRequest,
    ProvisionResponse, UpdateRequest, UpdateResponse, WebhookTarget,
};
