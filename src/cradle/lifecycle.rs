//! Lifecycle operations
//!
//! Create, delete, split and merge. Each operation claims the routers it
//! touches, moves records while the affected write gates are closed, and
//! publishes exactly one new directory version.

use std::sync::Arc;

use crate::error::{CradleError, Result};
use crate::keyspace::KeyRange;
use crate::maintain::Event;
use crate::router::{Claim, Queued, Router};
use crate::storage::Store;

use super::Cradle;

impl Cradle {
    /// Start a router for a currently unowned `range`
    pub fn create_node(&self, name: &str, range: KeyRange) -> Result<()> {
        if range.is_empty() {
            return Err(CradleError::RangeConflict(format!("{} is empty", range)));
        }
        let _claim = self.claim(&[name])?;
        if self.routers.read().contains_key(name) {
            return Err(CradleError::RangeConflict(format!(
                "router {} already exists",
                name
            )));
        }

        let router = self.start_router(name, &range, Claim::Unowned)?;
        let owner = self.owner(name);
        let published = match self.directory.update(|current| current.assign(&range, owner)) {
            Ok(published) => published,
            Err(e) => {
                self.discard(&router);
                return Err(e);
            }
        };

        self.routers.write().insert(name.to_string(), router);
        tracing::info!(
            "Created router {} for {} (directory v{})",
            name,
            range,
            published.version()
        );
        self.collaborators.maintain.log_event(Event::NodeCreated {
            name: name.to_string(),
            range,
        });
        self.log_publish(&published);
        Ok(())
    }

    /// Stop a router, return its range to the unowned pool and destroy its store
    pub fn delete_node(&self, name: &str) -> Result<()> {
        let _claim = self.claim(&[name])?;
        let router = self.require(name)?;

        let published = self.directory.update(|current| current.release(name))?;

        let parked = router.retire();
        router.reroute_all(parked);
        self.manager.deregister(name);
        self.routers.write().remove(name);
        self.collaborators.monitor.forget(name);
        self.collaborators.provider.destroy(name)?;

        tracing::info!("Deleted router {} (directory v{})", name, published.version());
        self.collaborators.maintain.log_event(Event::NodeDeleted {
            name: name.to_string(),
        });
        self.log_publish(&published);
        Ok(())
    }

    /// Move `[boundary, end)` of `name` to a new router; returns the new name.
    pub fn split_node(&self, name: &str, boundary: &[u8]) -> Result<String> {
        let _source_claim = self.claim(&[name])?;
        let source = self.require(name)?;
        let range = source.range();
        let (lower, upper) = range.split_at(boundary).ok_or_else(|| {
            CradleError::RangeConflict(format!(
                "boundary \"{}\" is not strictly inside {}",
                boundary.escape_ascii(),
                range
            ))
        })?;
        let created = self.next_name(name);
        let _target_claim = self.claim(&[&created])?;

        source.close_gate();
        tracing::info!("Splitting {} {} at \"{}\"", name, range, boundary.escape_ascii());

        // Nothing is visible to clients until the publish succeeds
        let target = match self.start_router(&created, &upper, Claim::Handoff(name.to_string())) {
            Ok(target) => target,
            Err(e) => {
                source.open_gate(Vec::new());
                return Err(e);
            }
        };
        let prepared = copy_records(source.store().as_ref(), target.store().as_ref(), &upper)
            .and_then(|copied| {
                let owner = self.owner(&created);
                let published = self
                    .directory
                    .update(|current| current.split(name, boundary, owner))?;
                Ok((copied, published))
            });
        let (copied, published) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.discard(&target);
                source.open_gate(Vec::new());
                return Err(e);
            }
        };

        // Published: the source now narrows to match the directory
        source.narrow(lower.clone());
        let parked = source.take_queued();
        let (to_target, to_source): (Vec<Queued>, Vec<Queued>) = parked
            .into_iter()
            .partition(|queued| upper.contains(&queued.envelope.request.key));
        target.open_gate(to_target);
        source.open_gate(to_source);
        self.routers.write().insert(created.clone(), target);

        tracing::info!(
            "Split {} into {} {} and {} {} ({} records moved, directory v{})",
            name,
            name,
            lower,
            created,
            upper,
            copied,
            published.version()
        );
        self.collaborators.maintain.log_event(Event::NodeSplit {
            source: name.to_string(),
            created: created.clone(),
            boundary: boundary.to_vec(),
        });
        self.log_publish(&published);

        // Both gates are open again; the source drops the moved half meanwhile
        if let Err(e) = source.purge_outside() {
            tracing::warn!("Removing migrated records from {} failed: {}", name, e);
            return Err(e);
        }
        Ok(created)
    }

    /// Fold two adjacent routers into the one with the lower start; returns the survivor.
    pub fn merge_node(&self, a: &str, b: &str) -> Result<String> {
        if a == b {
            return Err(CradleError::RangeConflict(format!("cannot merge {} with itself", a)));
        }
        let _claim = self.claim(&[a, b])?;
        let first = self.require(a)?;
        let second = self.require(b)?;

        let (first_range, second_range) = (first.range(), second.range());
        let combined = first_range.join(&second_range).ok_or_else(|| {
            CradleError::RangeConflict(format!(
                "{} {} and {} {} are not adjacent",
                a, first_range, b, second_range
            ))
        })?;
        let (survivor, absorbed) = if first_range.start() < second_range.start() {
            (first, second)
        } else {
            (second, first)
        };
        let survivor_range = survivor.range();

        survivor.close_gate();
        absorbed.close_gate();
        tracing::info!("Merging {} into {}", absorbed.name(), survivor.name());

        let prepared = copy_records(
            absorbed.store().as_ref(),
            survivor.store().as_ref(),
            &absorbed.range(),
        )
        .and_then(|copied| {
            survivor.widen(combined.clone());
            let published = self
                .directory
                .update(|current| current.merge(survivor.name(), absorbed.name()))?;
            Ok((copied, published))
        });
        let (copied, published) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                // Drop whatever was copied before the failure
                if let Err(undo) = survivor.shrink(survivor_range) {
                    tracing::warn!("Undoing merge copy into {} failed: {}", survivor.name(), undo);
                }
                survivor.open_gate(Vec::new());
                absorbed.open_gate(Vec::new());
                return Err(e);
            }
        };

        let parked = absorbed.retire();
        survivor.open_gate(parked);
        let absorbed_name = absorbed.name().to_string();
        self.manager.deregister(&absorbed_name);
        self.routers.write().remove(&absorbed_name);
        self.collaborators.monitor.forget(&absorbed_name);
        self.collaborators.provider.destroy(&absorbed_name)?;

        tracing::info!(
            "Merged {} into {} {} ({} records moved, directory v{})",
            absorbed_name,
            survivor.name(),
            combined,
            copied,
            published.version()
        );
        self.collaborators.maintain.log_event(Event::NodesMerged {
            survivor: survivor.name().to_string(),
            absorbed: absorbed_name,
        });
        self.log_publish(&published);
        Ok(survivor.name().to_string())
    }

    fn require(&self, name: &str) -> Result<Arc<Router>> {
        self.router(name)
            .ok_or_else(|| CradleError::UnknownNode(name.to_string()))
    }

    /// Tear down a router that never became visible in the directory
    fn discard(&self, router: &Arc<Router>) {
        let name = router.name().to_string();
        let parked = router.retire();
        router.reroute_all(parked);
        self.manager.deregister(&name);
        if let Err(e) = self.collaborators.provider.destroy(&name) {
            tracing::warn!("Destroying store of discarded router {} failed: {}", name, e);
        }
    }

    /// `base.N` for the smallest N not already in use on this host
    fn next_name(&self, name: &str) -> String {
        let base = match name.rsplit_once('.') {
            Some((base, suffix)) if suffix.parse::<u32>().is_ok() => base,
            _ => name,
        };
        let routers = self.routers.read();
        let busy = self.busy.lock();
        (1u32..)
            .map(|n| format!("{}.{}", base, n))
            .find(|candidate| !routers.contains_key(candidate) && !busy.contains(candidate))
            .unwrap_or_else(|| format!("{}.0", base))
    }
}

/// Copy every record of `from` inside `range` into `to`; returns the count
fn copy_records(from: &dyn Store, to: &dyn Store, range: &KeyRange) -> Result<usize> {
    let mut copied = 0;
    for record in from.scan(range, None)? {
        let record = record?;
        to.put(&record.key, &record.value)?;
        copied += 1;
    }
    to.flush()?;
    Ok(copied)
}
