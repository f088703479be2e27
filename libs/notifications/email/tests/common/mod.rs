#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

/// Fail the test if `fut` does not finish within `limit`
pub async fn within<T>(limit: Duration, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(limit, fut).await {
        Ok(out) => out,
        Err(_) => panic!("did not finish within {limit:?}"),
    }
}
