//! Periodic snapshots driven by the simulator's step reports. Each save
//! writes the simulator snapshot and the client table beside it.
//!
//! A failed autosave is logged and the simulation keeps running; only the
//! final save at shutdown is reported to the caller.

use std::path::PathBuf;
use std::sync::Arc;

use patchwork_core::StepReport;
use patchwork_session::ClientDirectory;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Write a snapshot of the world and its clients under `prefix` off the
/// async runtime.
pub async fn save(clients: &ClientDirectory, prefix: &str) -> Result<PathBuf, EngineError> {
    let clients = clients.clone();
    let prefix = prefix.to_owned();
    let path = tokio::task::spawn_blocking(move || clients.save(&prefix)).await??;
    Ok(path)
}

/// Whether a save is due after moving from `last_saved` to `time`.
///
/// True once the time has crossed a multiple of `frequency`, so skipped
/// reports do not skip a save.
fn is_due(last_saved: u64, time: u64, frequency: u64) -> bool {
    match (time.checked_div(frequency), last_saved.checked_div(frequency)) {
        (Some(now), Some(then)) => now > then,
        _ => false,
    }
}

/// Spawn the autosave task, or return `None` when `frequency` is zero.
pub fn spawn(
    clients: ClientDirectory,
    prefix: String,
    frequency: u64,
    shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if frequency == 0 {
        info!("Autosave disabled");
        return None;
    }
    // Subscribe before returning so no step after this call is missed.
    let reports = clients.simulator().subscribe();
    info!(frequency, prefix = %prefix, "Autosave enabled");
    Some(tokio::spawn(run(clients, reports, prefix, frequency, shutdown)))
}

async fn run(
    clients: ClientDirectory,
    mut reports: broadcast::Receiver<Arc<StepReport>>,
    prefix: String,
    frequency: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_saved = clients.simulator().time();
    loop {
        let time = tokio::select! {
            received = reports.recv() => match received {
                Ok(report) => report.time,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Autosave fell behind the step reports");
                    clients.simulator().time()
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        };
        if !is_due(last_saved, time, frequency) {
            continue;
        }
        match save(&clients, &prefix).await {
            Ok(path) => {
                debug!(time, path = %path.display(), "Autosaved");
                last_saved = time;
            }
            Err(e) => warn!(time, error = %e, "Autosave failed, continuing"),
        }
    }
    debug!("Autosave stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use patchwork_core::persistence::{clients_path, snapshot_path};
    use patchwork_core::{Simulator, SimulatorConfig};
    use patchwork_types::Permissions;

    use super::*;

    fn directory() -> ClientDirectory {
        let config: SimulatorConfig = patchwork_core::EngineConfig::parse(
            r"
simulator:
  patch_size: 8
  mcmc_num_iter: 10
  items:
    - name: banana
      scent: [1.0, 0.0, 0.0]
      color: [1.0, 0.0, 0.0]
      required_item_counts: [0]
      required_item_costs: [0]
      intensity: { fn: constant, args: [-1000.0] }
      interactions: [{ fn: zero }]
",
        )
        .unwrap()
        .simulator;
        ClientDirectory::new(Simulator::new(config).unwrap(), Permissions::grant_all())
    }

    #[test]
    fn saves_when_a_multiple_is_crossed() {
        assert!(is_due(0, 3, 3));
        assert!(!is_due(3, 5, 3));
        assert!(is_due(5, 7, 3));
        assert!(!is_due(0, 7, 0));
    }

    #[tokio::test]
    async fn snapshots_every_frequency_steps() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/auto_", dir.path().display());
        let clients = directory();
        let sim = clients.simulator().clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = spawn(clients, prefix.clone(), 2, shutdown_rx).unwrap();

        let (id, _) = sim.add_agent().unwrap();
        for until in [2, 4] {
            while sim.time() < until {
                sim.no_op(id).unwrap();
            }
            // The client table is written last.
            let saved = clients_path(&prefix, until);
            for _ in 0..200 {
                if saved.exists() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(saved.exists(), "no client table at step {until}");
            assert!(snapshot_path(&prefix, until).exists());
        }
        assert!(!snapshot_path(&prefix, 1).exists());
        assert!(!snapshot_path(&prefix, 3).exists());

        shutdown_tx.send_replace(true);
        task.await.unwrap();
    }

    #[test]
    fn zero_frequency_disables_autosave() {
        let (_tx, rx) = watch::channel(false);
        assert!(spawn(directory(), "unused_".to_owned(), 0, rx).is_none());
    }
}
