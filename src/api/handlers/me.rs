use axum::{extract::Extension, response::Json};

use crate::middleware::AuthContext;

/// Echo the request-scoped identity populated by the validation middleware.
pub async fn me(Extension(context): Extension<AuthContext>) -> Json<AuthContext> {
    Json(context)
}
