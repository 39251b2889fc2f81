//! Backend adapter contract.

use async_trait::async_trait;

use crate::errors::BackendResult;
use crate::stream::FragmentSource;
use crate::types::BackendRequest;

/// The model backend as seen by the session controller: submit a prompt,
/// receive a fragment source or a terminal error.
///
/// `invoke` resolving with `Ok` means the handshake (transport + auth)
/// succeeded. Errors after that point travel inside the fragment stream.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: BackendRequest) -> BackendResult<FragmentSource>;
}
