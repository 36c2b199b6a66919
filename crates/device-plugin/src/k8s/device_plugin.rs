use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use api_types::v1beta1::device_plugin_server::DevicePlugin;
use api_types::v1beta1::device_plugin_server::DevicePluginServer;
use api_types::v1beta1::registration_client::RegistrationClient;
use api_types::v1beta1::AllocateRequest;
use api_types::v1beta1::AllocateResponse;
use api_types::v1beta1::ContainerPreferredAllocationResponse;
use api_types::v1beta1::DevicePluginOptions;
use api_types::v1beta1::Empty;
use api_types::v1beta1::ListAndWatchResponse;
use api_types::v1beta1::PreStartContainerRequest;
use api_types::v1beta1::PreStartContainerResponse;
use api_types::v1beta1::PreferredAllocationRequest;
use api_types::v1beta1::PreferredAllocationResponse;
use api_types::v1beta1::RegisterRequest;
use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::crash_policy::CrashTracker;
use super::crash_policy::CrashVerdict;
use super::DevicePluginError;
use crate::context::PluginContext;
use crate::supervisor::EventSender;
use crate::supervisor::SupervisorEvent;

/// bound on waiting for the serve loop to drain on stop
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// pause between connection attempts while dialing a socket
const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Where the endpoint listens and how it reaches the kubelet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// directory shared with the kubelet (e.g. /var/lib/kubelet/device-plugins/)
    pub device_plugin_dir: PathBuf,
    /// file name of this plugin's socket inside `device_plugin_dir`
    pub socket_name: String,
    /// file name of the kubelet registration socket inside `device_plugin_dir`
    pub kubelet_socket_name: String,
    /// bound on the self-dial and on registration
    pub dial_timeout: Duration,
}

impl EndpointConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.device_plugin_dir.join(&self.socket_name)
    }

    pub fn kubelet_socket_path(&self) -> PathBuf {
        self.device_plugin_dir.join(&self.kubelet_socket_name)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            device_plugin_dir: PathBuf::from(api_types::DEVICE_PLUGIN_PATH),
            socket_name: "nvshare-device-plugin.sock".to_string(),
            kubelet_socket_name: api_types::KUBELET_SOCKET_NAME.to_string(),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

/// A live endpoint: its shutdown signal and the task serving the socket
#[derive(Debug)]
struct Running {
    shutdown: CancellationToken,
    serve_task: JoinHandle<()>,
}

/// One instance of the device plugin gRPC endpoint.
///
/// `start` binds the socket, serves it and registers with the kubelet;
/// `stop` tears all of it down again. A stopped endpoint is not reused, the
/// supervisor builds a fresh one on every restart.
#[derive(Debug)]
pub struct PluginEndpoint {
    context: Arc<PluginContext>,
    config: EndpointConfig,
    options: DevicePluginOptions,
    events: EventSender,
    running: Option<Running>,
}

impl PluginEndpoint {
    pub fn new(context: Arc<PluginContext>, config: EndpointConfig, events: EventSender) -> Self {
        let options = DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: true,
        };

        Self {
            context,
            config,
            options,
            events,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn socket_path(&self) -> PathBuf {
        self.config.socket_path()
    }

    /// Serve the plugin socket and register it with the kubelet.
    ///
    /// On failure nothing is left behind: the serve loop is stopped and the
    /// socket removed before the error is returned.
    #[tracing::instrument(skip(self), fields(resource = %self.context.resource_name))]
    pub async fn start(&mut self) -> Result<(), Report<DevicePluginError>> {
        if self.running.is_some() {
            return Ok(());
        }

        if let Err(e) = self.serve().await {
            error!(
                "could not start device plugin for '{}': {e:?}",
                self.context.resource_name
            );
            self.unwind().await;
            return Err(e);
        }
        info!(
            "starting to serve '{}' on {}",
            self.context.resource_name,
            self.config.socket_path().display()
        );

        if let Err(e) = self.register_with_kubelet().await {
            error!("could not register device plugin: {e:?}");
            self.unwind().await;
            return Err(e);
        }
        info!(
            "registered device plugin for '{}' with kubelet",
            self.context.resource_name
        );

        Ok(())
    }

    /// Stop serving and remove the socket. Stopping twice is a no-op.
    pub async fn stop(&mut self) -> Result<(), Report<DevicePluginError>> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        let socket_path = self.config.socket_path();
        info!(
            "stopping to serve '{}' on {}",
            self.context.resource_name,
            socket_path.display()
        );

        running.shutdown.cancel();
        let mut serve_task = running.serve_task;
        if tokio::time::timeout(STOP_TIMEOUT, &mut serve_task)
            .await
            .is_err()
        {
            warn!("serve loop did not finish within {STOP_TIMEOUT:?}, aborting it");
            serve_task.abort();
        }

        remove_socket(&socket_path).change_context_lazy(|| DevicePluginError::Transport {
            message: format!("failed to remove {}", socket_path.display()),
        })
    }

    async fn unwind(&mut self) {
        if let Err(e) = self.stop().await {
            warn!("failed to clean up after unsuccessful start: {e:?}");
        }
    }

    /// bind the socket, spawn the serve loop and check it accepts connections
    async fn serve(&mut self) -> Result<(), Report<DevicePluginError>> {
        let socket_path = self.config.socket_path();
        let transport_error = || DevicePluginError::Transport {
            message: format!("cannot serve on {}", socket_path.display()),
        };

        remove_socket(&socket_path).change_context_lazy(transport_error)?;
        let listener = UnixListener::bind(&socket_path).change_context_lazy(transport_error)?;
        debug!("gRPC server is bound to: {}", socket_path.display());

        let shutdown = CancellationToken::new();
        let service = Arc::new(DevicePluginService::new(
            self.context.clone(),
            self.options.clone(),
            shutdown.clone(),
        ));
        let listener = Arc::new(listener);
        let serve_task = tokio::spawn(serve_loop(
            move || incoming(listener.clone()),
            service,
            shutdown.clone(),
            self.events.clone(),
            self.context.resource_name.clone(),
        ));
        self.running = Some(Running {
            shutdown,
            serve_task,
        });

        // the connection is dropped right away, it only proves the loop accepts
        dial(&socket_path, self.config.dial_timeout)
            .await
            .change_context_lazy(transport_error)?;

        Ok(())
    }

    /// register device plugin with kubelet
    async fn register_with_kubelet(&self) -> Result<(), Report<DevicePluginError>> {
        let kubelet_socket = self.config.kubelet_socket_path();
        info!(
            "registering device plugin with kubelet: {}",
            kubelet_socket.display()
        );
        let registration_error = |message: String| DevicePluginError::Registration { message };

        let channel = dial(&kubelet_socket, self.config.dial_timeout)
            .await
            .change_context_lazy(|| {
                registration_error(format!("cannot reach {}", kubelet_socket.display()))
            })?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: api_types::VERSION.to_string(),
            endpoint: self.config.socket_name.clone(),
            resource_name: self.context.resource_name.clone(),
            options: Some(self.options.clone()),
        };

        tokio::time::timeout(self.config.dial_timeout, client.register(Request::new(request)))
            .await
            .change_context_lazy(|| registration_error("kubelet did not answer".to_string()))?
            .change_context_lazy(|| registration_error("kubelet rejected the request".to_string()))
            .attach_printable_lazy(|| format!("endpoint: {}", self.config.socket_name))?;

        Ok(())
    }
}

/// Accepted connections of one server run.
type Incoming = Pin<Box<dyn Stream<Item = io::Result<UnixStream>> + Send>>;

/// Serve until shutdown, restarting the server when it crashes.
///
/// `accept` is called once per server run. A run that ends while the
/// endpoint is still wanted counts as a crash.
async fn serve_loop<F>(
    accept: F,
    service: Arc<DevicePluginService>,
    shutdown: CancellationToken,
    events: EventSender,
    resource_name: String,
) where
    F: Fn() -> Incoming + Send + 'static,
{
    let mut crashes = CrashTracker::new(Instant::now());

    loop {
        info!("starting gRPC server for '{resource_name}'");
        let result = tonic::transport::Server::builder()
            .add_service(DevicePluginServer::from_arc(service.clone()))
            .serve_with_incoming_shutdown(accept(), shutdown.clone().cancelled_owned())
            .await;

        if shutdown.is_cancelled() {
            break;
        }
        match result {
            Ok(()) => error!("gRPC server for '{resource_name}' stopped accepting connections"),
            Err(e) => error!("gRPC server for '{resource_name}' crashed with error: {e}"),
        }

        if let CrashVerdict::GiveUp { recent_crashes } = crashes.record_crash(Instant::now()) {
            error!(
                "gRPC server for '{resource_name}' has crashed {recent_crashes} times recently, giving up"
            );
            if events.send(SupervisorEvent::CrashLoop).is_err() {
                warn!("supervisor is gone, cannot report crash loop");
            }
            break;
        }
    }

    info!("gRPC server for '{resource_name}' stopped");
}

/// Connections accepted on a listener that outlives each server run.
///
/// The stream ends after the first accept error, which ends the run.
fn incoming(listener: Arc<UnixListener>) -> Incoming {
    Box::pin(futures::stream::unfold(Some(listener), |listener| async move {
        let listener = listener?;
        match listener.accept().await {
            Ok((stream, _addr)) => Some((Ok(stream), Some(listener))),
            Err(e) => {
                error!("failed to accept connection: {e}");
                Some((Err(e), None))
            }
        }
    }))
}

/// Dial a Unix socket, retrying until it answers or `timeout` runs out.
async fn dial(socket_path: &Path, timeout: Duration) -> Result<Channel, Report<io::Error>> {
    let attempts = async {
        loop {
            match create_uds_channel(socket_path).await {
                Ok(channel) => return channel,
                Err(e) => {
                    debug!("dial {} failed, retrying: {e}", socket_path.display());
                    tokio::time::sleep(DIAL_RETRY_INTERVAL).await;
                }
            }
        }
    };

    tokio::time::timeout(timeout, attempts).await.map_err(|_| {
        Report::new(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("timed out dialing {}", socket_path.display()),
        ))
    })
}

/// create Unix Domain Socket client connection
async fn create_uds_channel(socket_path: &Path) -> Result<Channel, tonic::transport::Error> {
    let socket_path = socket_path.to_path_buf();

    // the URI is a placeholder, the connector always dials the socket
    Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await
}

/// remove a socket file, a missing file is fine
fn remove_socket(socket_path: &Path) -> io::Result<()> {
    match std::fs::remove_file(socket_path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// DevicePlugin service implementation
/// advertises the virtual slots and answers allocation requests
#[derive(Debug)]
pub struct DevicePluginService {
    context: Arc<PluginContext>,
    options: DevicePluginOptions,
    /// fires when the owning endpoint stops
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        context: Arc<PluginContext>,
        options: DevicePluginOptions,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            context,
            options,
            cancellation_token,
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    /// get device plugin options
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(self.options.clone()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Advertise all slots once and hold the stream open until the endpoint
    /// stops. Slot health is not monitored: if the underlying accelerator
    /// fails, the vendor device plugin fails this plugin's pod instead.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");

        let (tx, rx) = mpsc::unbounded_channel();
        let cancellation_token = self.cancellation_token.clone();
        let devices = self.context.devices.clone();

        tokio::spawn(async move {
            let device_count = devices.len();
            if let Err(e) = tx.send(Ok(ListAndWatchResponse { devices })) {
                error!("failed to send initial device list: {}", e);
                return;
            }
            info!("sent list and watch response with {device_count} devices");

            // dropping the sender ends the stream
            cancellation_token.cancelled().await;
            info!("device watch task stopped");
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    /// pick slots from the least loaded accelerators first
    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);

        let container_responses = req
            .container_requests
            .iter()
            .map(|container_req| {
                let size = usize::try_from(container_req.allocation_size).unwrap_or(0);
                let device_ids = self.context.preference.preferred_allocation(
                    &container_req.available_device_ids,
                    &container_req.must_include_device_ids,
                    size,
                );
                ContainerPreferredAllocationResponse { device_ids }
            })
            .collect();
        debug!(
            "accelerator loads after preference: {:?}",
            self.context.preference.tracker().snapshot()
        );

        Ok(Response::new(PreferredAllocationResponse {
            container_responses,
        }))
    }

    /// allocate devices to container
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();

        let results = self.context.allocation.allocate(
            req.container_requests
                .iter()
                .map(|container_req| &container_req.devices_ids),
        );

        let mut container_responses = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(allocation) => {
                    info!(
                        "container request {index} gets accelerators {:?}",
                        allocation.accelerator_ids
                    );
                    container_responses.push(allocation.into());
                }
                Err(e) => {
                    error!("container request {index} cannot be allocated: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        // the response has no per-container error, so any failure fails the call
        if let Some(e) = first_error {
            return Err(Status::invalid_argument(format!(
                "invalid allocation request for '{}' - {e}",
                self.context.resource_name
            )));
        }

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    /// pre-start is not required by this plugin, acknowledge and move on
    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.into_inner());
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
