pub mod health;
pub mod rates;
pub mod status;
pub mod subscriptions;
pub mod verify;

pub use health::*;
pub use rates::*;
pub use status::*;
pub use subscriptions::*;
pub use verify::*;

use crate::engine::Engine;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}
