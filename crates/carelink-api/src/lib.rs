pub mod conversations;
pub mod messages;
pub mod middleware;
pub mod participants;

use std::sync::Arc;

use carelink_gateway::router::MessageRouter;
use carelink_store::Database;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub router: MessageRouter,
}
