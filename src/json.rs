//! A strict JSON body extractor: 4 MiB size limit, unknown-field
//! rejection, trailing-data rejection (spec §4.8).

use axum::{
    async_trait,
    extract::{rejection::BytesRejection, FromRequest, Request},
};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::WikiError;

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

pub struct StrictJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for StrictJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = WikiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(map_bytes_rejection)?;

        let mut de = serde_json::Deserializer::from_slice(&bytes);
        let value = T::deserialize(&mut de)
            .map_err(|e| WikiError::InvalidPayload(e.to_string()))?;
        de.end()
            .map_err(|_| WikiError::InvalidPayload("unexpected trailing data".to_string()))?;

        let _ = state;
        Ok(StrictJson(value))
    }
}

fn map_bytes_rejection(_: BytesRejection) -> WikiError {
    WikiError::InvalidPayload(format!("request body exceeds {MAX_BODY_BYTES} bytes"))
}
