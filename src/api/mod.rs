mod client;
mod types;

pub use client::{ApiClient, ApiError, RetryPolicy, DETAIL_BATCH_SIZE};
pub use types::{
    extract_identity, EntityKind, Identity, ListEntry, MapPlayer, MapPlayersResponse,
    OnlineResponse, ServerResponse,
};
