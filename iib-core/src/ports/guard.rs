//! Scoped acquisition of port sets around an operation

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use tracing::{debug, warn};

use super::generator::PortStackGenerator;
use super::lock::{LeaseProvider, PortLease};
use crate::error::{IibError, Result};

/// Ports handed to a guarded operation, keyed by purpose
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortAssignment {
    ports: BTreeMap<String, u16>,
}

impl PortAssignment {
    pub fn get(&self, purpose: &str) -> Option<u16> {
        self.ports.get(purpose).copied()
    }

    /// Like [`get`](Self::get) but a missing purpose is an error
    pub fn require(&self, purpose: &str) -> Result<u16> {
        self.get(purpose)
            .ok_or_else(|| IibError::Config(format!("No port leased for {purpose}")))
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// Which contention errors move on to the next candidate set
#[derive(Debug, Clone, Copy, Default)]
pub struct PortRetryPolicy {
    /// Also retry when an unrelated process has the port bound
    pub retry_system_conflicts: bool,
}

impl PortRetryPolicy {
    fn should_retry(&self, err: &IibError) -> bool {
        err.is_worker_contention() || (self.retry_system_conflicts && err.is_system_contention())
    }
}

/// Leases held together; whatever is still held is released on drop
#[derive(Default)]
pub struct LeaseSet {
    leases: Vec<Box<dyn PortLease>>,
}

impl LeaseSet {
    pub fn assignment(&self) -> PortAssignment {
        PortAssignment {
            ports: self
                .leases
                .iter()
                .map(|lease| (lease.purpose().to_string(), lease.port()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Release every held lease; the first failure is returned after all
    /// leases have been tried
    pub fn release_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for mut lease in self.leases.drain(..) {
            if !lease.is_locked() {
                continue;
            }
            if let Err(e) = lease.release() {
                warn!(port = lease.port(), purpose = lease.purpose(), error = %e, "Failed to release port lease");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for LeaseSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseSet")
            .field("ports", &self.assignment().ports)
            .field("held", &self.leases.iter().filter(|lease| lease.is_locked()).count())
            .finish()
    }
}

impl Drop for LeaseSet {
    fn drop(&mut self) {
        if self.leases.iter().any(|lease| lease.is_locked()) {
            debug!("Releasing port leases left held at drop");
            let _ = self.release_all();
        }
    }
}

/// Acquire the first candidate set whose leases can all be taken
///
/// A set that fails part way has its already-acquired leases released
/// before the next set is tried.
pub fn acquire_port_set(
    generator: &mut PortStackGenerator,
    leases: &dyn LeaseProvider,
    policy: PortRetryPolicy,
) -> Result<LeaseSet> {
    loop {
        let candidates = generator.next_set()?;
        let mut held = LeaseSet::default();
        let mut failure = None;

        for (purpose, port) in candidates {
            let mut lease = leases.lease(&purpose, port);
            match lease.acquire() {
                Ok(()) => held.leases.push(lease),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let Some(err) = failure else {
            debug!(ports = ?held.assignment(), "Acquired port set");
            return Ok(held);
        };

        held.release_all()?;
        if !policy.should_retry(&err) {
            return Err(err);
        }
        debug!(error = %err, attempt = generator.attempts(), "Port set unavailable, trying next set");
    }
}

/// Run `op` with a leased port set, releasing it on every exit path
///
/// An error from `op` takes precedence over a release failure.
pub async fn with_port_leases<T, F, Fut>(
    generator: &mut PortStackGenerator,
    leases: &dyn LeaseProvider,
    policy: PortRetryPolicy,
    op: F,
) -> Result<T>
where
    F: FnOnce(PortAssignment) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut held = acquire_port_set(generator, leases, policy)?;
    let outcome = op(held.assignment()).await;
    let released = held.release_all();

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release_err)) => Err(release_err),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            warn!(error = %release_err, "Port release failed after operation error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ContentionKind;
    use crate::ports::lock::{marker_file_name, MarkerFileLeases};
    use std::collections::VecDeque;
    use std::net::{Ipv4Addr, TcpListener};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Acquire outcomes are popped from a shared script; `None` means success
    #[derive(Default)]
    struct Script {
        outcomes: Mutex<VecDeque<Option<ContentionKind>>>,
        acquires: AtomicUsize,
        releases: AtomicUsize,
    }

    struct ScriptedLeases(Arc<Script>);

    struct ScriptedLease {
        script: Arc<Script>,
        purpose: String,
        port: u16,
        locked: bool,
    }

    impl LeaseProvider for ScriptedLeases {
        fn lease(&self, purpose: &str, port: u16) -> Box<dyn PortLease> {
            Box::new(ScriptedLease {
                script: Arc::clone(&self.0),
                purpose: purpose.to_string(),
                port,
                locked: false,
            })
        }
    }

    impl PortLease for ScriptedLease {
        fn purpose(&self) -> &str {
            &self.purpose
        }

        fn port(&self) -> u16 {
            self.port
        }

        fn is_locked(&self) -> bool {
            self.locked
        }

        fn acquire(&mut self) -> Result<()> {
            self.script.acquires.fetch_add(1, Ordering::SeqCst);
            let outcome = self.script.outcomes.lock().unwrap().pop_front().flatten();
            match outcome {
                None => {
                    self.locked = true;
                    Ok(())
                }
                Some(kind) => Err(IibError::AddressInUse {
                    port: self.port,
                    kind,
                }),
            }
        }

        fn release(&mut self) -> Result<()> {
            self.script.releases.fetch_add(1, Ordering::SeqCst);
            self.locked = false;
            Ok(())
        }
    }

    fn scripted(outcomes: Vec<Option<ContentionKind>>) -> (Arc<Script>, ScriptedLeases) {
        let script = Arc::new(Script {
            outcomes: Mutex::new(outcomes.into()),
            ..Default::default()
        });
        (Arc::clone(&script), ScriptedLeases(script))
    }

    fn two_purpose_generator(sets: u16) -> PortStackGenerator {
        let stacks = (0..sets).map(|i| vec![5001 + i, 6001 + i]).collect();
        PortStackGenerator::new(
            stacks,
            vec!["opm_port".to_string(), "opm_pprof_port".to_string()],
        )
    }

    const WORKER: Option<ContentionKind> = Some(ContentionKind::Worker);
    const SYSTEM: Option<ContentionKind> = Some(ContentionKind::System);

    #[tokio::test]
    async fn test_retries_past_worker_contention() {
        let (script, leases) = scripted(vec![None, WORKER, WORKER, None, None]);
        let mut generator = two_purpose_generator(3);

        let ports = with_port_leases(
            &mut generator,
            &leases,
            PortRetryPolicy::default(),
            |ports| async move { Ok(ports) },
        )
        .await
        .unwrap();

        assert_eq!(ports.get("opm_port"), Some(5003));
        assert_eq!(ports.get("opm_pprof_port"), Some(6003));
        assert_eq!(script.acquires.load(Ordering::SeqCst), 5);
        // one partial release on the first set, two after the operation
        assert_eq!(script.releases.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_purpose_contention_counts() {
        let (script, leases) = scripted(vec![WORKER, WORKER, None]);
        let mut generator = PortStackGenerator::new(
            vec![vec![5001], vec![5002], vec![5003], vec![5004]],
            vec!["opm_port".to_string()],
        );

        with_port_leases(&mut generator, &leases, PortRetryPolicy::default(), |_| async {
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(script.acquires.load(Ordering::SeqCst), 3);
        assert_eq!(script.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_after_single_set() {
        let (script, leases) = scripted(vec![WORKER]);
        let mut generator = two_purpose_generator(1);

        let err = with_port_leases(&mut generator, &leases, PortRetryPolicy::default(), |_| async {
            Ok(())
        })
        .await
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "No free port has been found after 1 attempts."
        );
        assert_eq!(script.acquires.load(Ordering::SeqCst), 1);
        assert_eq!(script.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_system_contention_not_retried_by_default() {
        let (script, leases) = scripted(vec![None, SYSTEM, None, None]);
        let mut generator = two_purpose_generator(2);

        let err = with_port_leases(&mut generator, &leases, PortRetryPolicy::default(), |_| async {
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(err.is_system_contention());
        assert_eq!(script.acquires.load(Ordering::SeqCst), 2);
        assert_eq!(script.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_system_contention_retried_when_allowed() {
        let (script, leases) = scripted(vec![None, SYSTEM, None, None]);
        let mut generator = two_purpose_generator(2);
        let policy = PortRetryPolicy {
            retry_system_conflicts: true,
        };

        let ports = with_port_leases(&mut generator, &leases, policy, |ports| async move {
            Ok(ports)
        })
        .await
        .unwrap();

        assert_eq!(ports.get("opm_port"), Some(5002));
        assert_eq!(script.acquires.load(Ordering::SeqCst), 4);
        assert_eq!(script.releases.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_leases_released_when_operation_fails() {
        let (script, leases) = scripted(vec![None, None]);
        let mut generator = two_purpose_generator(1);

        let err = with_port_leases::<(), _, _>(
            &mut generator,
            &leases,
            PortRetryPolicy::default(),
            |_| async { Err(IibError::Catalog("serve exploded".into())) },
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "serve exploded");
        assert_eq!(script.releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drop_releases_held_leases() {
        let (script, leases) = scripted(vec![None, None]);
        let mut generator = two_purpose_generator(1);

        let held = acquire_port_set(&mut generator, &leases, PortRetryPolicy::default()).unwrap();
        assert_eq!(held.len(), 2);
        drop(held);

        assert_eq!(script.releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_lease_set_debug_lists_held_ports() {
        let (_script, leases) = scripted(vec![None, None]);
        let mut generator = two_purpose_generator(1);

        let mut held = acquire_port_set(&mut generator, &leases, PortRetryPolicy::default()).unwrap();
        assert_eq!(
            format!("{held:?}"),
            r#"LeaseSet { ports: {"opm_port": 5001, "opm_pprof_port": 6001}, held: 2 }"#
        );

        held.release_all().unwrap();
        assert_eq!(format!("{held:?}"), "LeaseSet { ports: {}, held: 0 }");
    }

    #[tokio::test]
    async fn test_marker_files_skip_port_held_by_other_worker() {
        let dir = tempfile::TempDir::new().unwrap();
        let free_port = || {
            TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
                .unwrap()
                .local_addr()
                .unwrap()
                .port()
        };
        let (busy, open) = (free_port(), free_port());
        std::fs::write(dir.path().join(marker_file_name("opm_port", busy)), "").unwrap();

        let leases = MarkerFileLeases::new(dir.path().to_path_buf());
        let mut generator =
            PortStackGenerator::new(vec![vec![busy], vec![open]], vec!["opm_port".to_string()]);

        let marker = dir.path().join(marker_file_name("opm_port", open));
        let marker_in_op = marker.clone();
        let port = with_port_leases(
            &mut generator,
            &leases,
            PortRetryPolicy::default(),
            |ports| async move {
                assert!(marker_in_op.exists());
                ports.require("opm_port")
            },
        )
        .await
        .unwrap();

        assert_eq!(port, open);
        assert!(!marker.exists());
        assert!(dir.path().join(marker_file_name("opm_port", busy)).exists());
    }
}
