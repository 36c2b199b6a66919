use std::io;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecursiveMode;
use notify::RecommendedWatcher;
use notify::Watcher;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;

use crate::k8s::DevicePluginError;
use crate::k8s::EndpointConfig;
use crate::supervisor::EventSender;
use crate::supervisor::Signal;
use crate::supervisor::SupervisorEvent;

/// Watch the device plugin directory for the kubelet socket being created.
///
/// Events stop when the returned watcher is dropped.
pub fn watch_kubelet_socket(
    config: &EndpointConfig,
    events: EventSender,
) -> Result<RecommendedWatcher, Report<DevicePluginError>> {
    let dir = config.device_plugin_dir.clone();
    let kubelet_socket_name = config.kubelet_socket_name.clone();
    let watch_error = || DevicePluginError::Watch {
        path: dir.display().to_string(),
    };

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) if is_socket_created(&event, &kubelet_socket_name) => {
                    SupervisorEvent::KubeletRestarted
                }
                Ok(event) => {
                    debug!("ignoring filesystem event: {:?}", event);
                    return;
                }
                Err(e) => SupervisorEvent::WatchError(e.to_string()),
            };
            // a closed channel means the supervisor is gone
            let _ = events.send(event);
        },
        Config::default(),
    )
    .change_context_lazy(watch_error)?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .change_context_lazy(watch_error)?;
    info!("watching {} for kubelet restarts", dir.display());

    Ok(watcher)
}

fn is_socket_created(event: &Event, socket_name: &str) -> bool {
    matches!(event.kind, EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|path| path.file_name().is_some_and(|name| name == socket_name))
}

/// Forward SIGHUP, SIGINT, SIGTERM and SIGQUIT to the supervisor.
pub fn spawn_signal_watcher(events: EventSender) -> io::Result<JoinHandle<()>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = hangup.recv() => Signal::Hangup,
                _ = interrupt.recv() => Signal::Interrupt,
                _ = terminate.recv() => Signal::Terminate,
                _ = quit.recv() => Signal::Quit,
            };
            debug!("received {received}");
            if events.send(SupervisorEvent::Signal(received)).is_err() {
                break;
            }
        }
    }))
}

pub fn kubelet_socket_exists(config: &EndpointConfig) -> bool {
    config.kubelet_socket_path().exists()
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use tokio::sync::mpsc;

    use super::*;

    fn config(dir: &Path) -> EndpointConfig {
        EndpointConfig {
            device_plugin_dir: dir.to_path_buf(),
            ..EndpointConfig::default()
        }
    }

    #[test_log::test(tokio::test)]
    async fn kubelet_socket_creation_is_reported() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let config = config(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = watch_kubelet_socket(&config, tx).expect("should watch");

        std::fs::write(dir.path().join("other.sock"), b"").expect("should write");
        std::fs::write(config.kubelet_socket_path(), b"").expect("should write");

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("should receive event")
            .expect("channel open");
        assert_eq!(event, SupervisorEvent::KubeletRestarted);
        assert!(kubelet_socket_exists(&config));
    }

    #[test]
    fn missing_directory_cannot_be_watched() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let config = config(&dir.path().join("missing"));
        let (tx, _rx) = mpsc::unbounded_channel();

        let report = watch_kubelet_socket(&config, tx).expect_err("should fail");
        assert!(matches!(
            report.current_context(),
            DevicePluginError::Watch { .. }
        ));
    }

    #[test_log::test(tokio::test)]
    async fn sighup_is_forwarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = spawn_signal_watcher(tx).expect("should install handlers");

        // SAFETY: raising a signal a tokio handler is installed for
        unsafe {
            libc::raise(libc::SIGHUP);
        }

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("should receive event")
            .expect("channel open");
        assert_eq!(event, SupervisorEvent::Signal(Signal::Hangup));
        task.abort();
    }
}
