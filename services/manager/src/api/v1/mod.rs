//! API v1 routes.

mod nodes;
mod secrets;
mod services;
mod tasks;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/services", services::routes())
        .nest("/secrets", secrets::routes())
        .nest("/tasks", tasks::routes())
        .nest("/nodes", nodes::routes())
}
