use std::future::Future;

/// Errors surfaced by a CAS attempt.
///
/// `Conflict` must be distinguishable from every other failure: it is the
/// store-specific signal that the write lost a race against a newer
/// revision, and is the only variant [`cas_update`] treats specially.
#[derive(Debug, thiserror::Error)]
pub enum CasError {
    #[error("revision conflict")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The single shared optimistic-concurrency primitive every entity's
/// lifecycle method is built on (spec component 4.1).
///
/// - `mutate` brings `entity` toward the desired state in place.
/// - `persist` attempts to write `entity` with its current revision token,
///   returning the freshly persisted value (with its new revision) on
///   success, or [`CasError::Conflict`] when the store's revision has moved
///   on.
/// - `predicate` reports whether `entity` is already in the desired state.
/// - `refresh` reloads and returns the current value of `entity` from the
///   store.
///
/// Returns `Ok(true)` iff this call performed the transition, `Ok(false)` if
/// the entity was already at (or reached, by a racing writer) the target
/// state. Any other error is propagated unchanged.
pub async fn cas_update<T, MutateFn, PersistFn, PersistFut, PredicateFn, RefreshFn, RefreshFut>(
    entity: &mut T,
    mutate: MutateFn,
    persist: PersistFn,
    predicate: PredicateFn,
    refresh: RefreshFn,
) -> Result<bool, CasError>
where
    MutateFn: Fn(&mut T),
    PersistFn: Fn(&T) -> PersistFut,
    PersistFut: Future<Output = Result<T, CasError>>,
    PredicateFn: Fn(&T) -> bool,
    RefreshFn: Fn(&T) -> RefreshFut,
    RefreshFut: Future<Output = Result<T, CasError>>,
{
    if predicate(entity) {
        return Ok(false);
    }

    loop {
        mutate(entity);
        match persist(entity).await {
            Ok(persisted) => {
                *entity = persisted;
                return Ok(true);
            }
            Err(CasError::Conflict) => {
                *entity = refresh(entity).await?;
                if predicate(entity) {
                    return Ok(false);
                }
                // Someone else moved the revision forward but not to the
                // target state; loop and try again against the fresh rev.
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    struct Counter {
        value: u32,
        rev: u32,
    }

    #[tokio::test]
    async fn already_at_target_skips_write() {
        let mut entity = Counter { value: 5, rev: 1 };
        let writes = Arc::new(AtomicUsize::new(0));
        let w = writes.clone();

        let changed = cas_update(
            &mut entity,
            |e: &mut Counter| e.value = 5,
            move |e: &Counter| {
                w.fetch_add(1, Ordering::SeqCst);
                let next = e.clone();
                async move { Ok(next) }
            },
            |e: &Counter| e.value == 5,
            |e: &Counter| {
                let next = e.clone();
                async move { Ok(next) }
            },
        )
        .await
        .unwrap();

        assert!(!changed);
        assert_eq!(writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn conflict_then_refresh_then_success() {
        let mut entity = Counter { value: 0, rev: 1 };
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();

        let changed = cas_update(
            &mut entity,
            |e: &mut Counter| e.value = 9,
            move |e: &Counter| {
                let n = a.fetch_add(1, Ordering::SeqCst);
                let rev = e.rev;
                let mut next = e.clone();
                async move {
                    if n == 0 {
                        Err(CasError::Conflict)
                    } else {
                        assert_eq!(rev, 2, "persist should see the refreshed revision");
                        next.rev = rev + 1;
                        Ok(next)
                    }
                }
            },
            |e: &Counter| e.value == 9 && e.rev == 3,
            |e: &Counter| {
                let mut next = e.clone();
                next.rev = 2;
                async move { Ok(next) }
            },
        )
        .await
        .unwrap();

        assert!(changed);
        assert_eq!(entity.value, 9);
        assert_eq!(entity.rev, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn conflict_then_refresh_finds_target_already_reached() {
        let mut entity = Counter { value: 0, rev: 1 };

        let changed = cas_update(
            &mut entity,
            |e: &mut Counter| e.value = 9,
            |_e: &Counter| async { Err(CasError::Conflict) },
            |e: &Counter| e.value == 9,
            |e: &Counter| {
                // A racing writer already reached the target state.
                let mut next = e.clone();
                next.value = 9;
                next.rev = 2;
                async move { Ok(next) }
            },
        )
        .await
        .unwrap();

        assert!(!changed);
        assert_eq!(entity.value, 9);
    }
}
