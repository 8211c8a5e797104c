use crate::{
    pages::{Notice, RenderError},
    server::SharedState,
};
use axum::{
    extract::{rejection::QueryRejection, Query, State},
    response::Html,
};
use serde::Deserialize;
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct IndexQuery {
    error: Option<Notice>,
}

#[instrument(skip(state, query))]
pub async fn index(
    State(state): State<SharedState>,
    query: Result<Query<IndexQuery>, QueryRejection>,
) -> Result<Html<String>, RenderError> {
    state.metrics.record_request("/");
    let notice = query.ok().and_then(|Query(query)| query.error);
    Ok(Html(state.pages.index(notice)?))
}
