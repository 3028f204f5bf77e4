//! Per-scope lease held for the duration of a bootstrap run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use keel_boot::CancellationToken;
use keel_persist::SqliteStore;
use tracing::{debug, warn};

/// Run `work` while holding the lease on `scope`.
///
/// The lease is renewed every third of `ttl_secs`; if a renewal is refused or fails the
/// token handed to `work` is cancelled. The lease is released however `work` ends.
pub async fn with_lease<F, T>(
    store: Arc<SqliteStore>,
    scope: &str,
    holder: &str,
    ttl_secs: i64,
    work: impl FnOnce(CancellationToken) -> F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if !store.try_acquire_lease(scope, holder, ttl_secs)? {
        bail!("another bootstrap holds the lease for scope {}; retry once it finishes", scope);
    }

    let cancel = CancellationToken::new();
    let stop = CancellationToken::new();
    let renewer = {
        let (store, scope, holder) = (store.clone(), scope.to_string(), holder.to_string());
        let (cancel, stop) = (cancel.clone(), stop.clone());
        let every = Duration::from_secs(u64::try_from(ttl_secs / 3).unwrap_or(0).max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(every) => {}
                }
                match store.try_acquire_lease(&scope, &holder, ttl_secs) {
                    Ok(true) => debug!(scope = %scope, "lease renewed"),
                    Ok(false) => {
                        warn!(scope = %scope, "lease taken by another holder; cancelling bootstrap");
                        cancel.cancel();
                        return;
                    }
                    Err(e) => {
                        warn!(scope = %scope, error = %e, "lease renewal failed; cancelling bootstrap");
                        cancel.cancel();
                        return;
                    }
                }
            }
        })
    };

    let out = work(cancel).await;
    stop.cancel();
    if let Err(e) = renewer.await {
        warn!(error = %e, "lease renewal task ended abnormally");
    }
    if let Err(e) = store.release_lease(scope, holder) {
        warn!(error = %e, scope = %scope, "failed to release lease; it expires on its own");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> Arc<SqliteStore> {
        let p = std::env::temp_dir().join(format!("keelctl-lease-{}.db", uuid::Uuid::new_v4()));
        Arc::new(SqliteStore::open(&p.to_string_lossy()).unwrap())
    }

    #[tokio::test]
    async fn failed_work_still_releases_the_lease() {
        let store = temp_store();
        let out: Result<()> = with_lease(store.clone(), "test", "a", 600, |_| async {
            Err(anyhow::anyhow!("no kubeconfig"))
        })
        .await;
        assert!(out.is_err());
        assert!(store.try_acquire_lease("test", "b", 600).unwrap());
    }

    #[tokio::test]
    async fn lease_is_exclusive_while_work_runs() {
        let store = temp_store();
        let inner = store.clone();
        let refused = with_lease(store.clone(), "test", "a", 600, |_| async move {
            inner.try_acquire_lease("test", "b", 600)
        })
        .await
        .unwrap();
        assert!(!refused);

        let held = with_lease(store.clone(), "test", "b", 600, |_| async { Ok(()) });
        assert!(store.try_acquire_lease("test", "c", 600).unwrap());
        assert!(held.await.is_err(), "c holds the lease now");
    }

    #[tokio::test(start_paused = true)]
    async fn losing_the_lease_cancels_the_work() {
        let store = temp_store();
        let inner = store.clone();
        let cancelled = with_lease(store.clone(), "test", "a", 30, |cancel| async move {
            // another runner takes over, as after an expiry
            inner.release_lease("test", "a")?;
            assert!(inner.try_acquire_lease("test", "run-b", 600)?);
            cancel.cancelled().await;
            Ok::<_, anyhow::Error>(true)
        })
        .await
        .unwrap();
        assert!(cancelled);
        assert!(!store.try_acquire_lease("test", "c", 600).unwrap(), "run-b keeps its lease");
    }
}
