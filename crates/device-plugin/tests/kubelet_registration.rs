use std::num::NonZeroU32;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use api_types::v1beta1::device_plugin_client::DevicePluginClient;
use api_types::v1beta1::registration_server::Registration;
use api_types::v1beta1::registration_server::RegistrationServer;
use api_types::v1beta1::AllocateRequest;
use api_types::v1beta1::ContainerAllocateRequest;
use api_types::v1beta1::ContainerPreferredAllocationRequest;
use api_types::v1beta1::Empty;
use api_types::v1beta1::PreferredAllocationRequest;
use api_types::v1beta1::RegisterRequest;
use device_plugin::allocation::WorkloadPaths;
use device_plugin::context::PluginContext;
use device_plugin::inventory::Backend;
use device_plugin::inventory::Exposure;
use device_plugin::inventory::Inventory;
use device_plugin::inventory::NVIDIA_VISIBLE_DEVICES;
use device_plugin::k8s::EndpointConfig;
use device_plugin::supervisor::Signal;
use device_plugin::supervisor::Supervisor;
use device_plugin::supervisor::SupervisorEvent;
use hyper_util::rt::TokioIo;
use similar_asserts::assert_eq;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Server;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tower::service_fn;

const RESOURCE_NAME: &str = "nvshare.com/gpu";
const SOCKET_NAME: &str = "nvshare-test.sock";
const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

struct FakeKubelet {
    registrations: mpsc::UnboundedSender<RegisterRequest>,
    /// number of registrations still to be refused
    rejections: AtomicUsize,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Empty>, Status> {
        let _ = self.registrations.send(request.into_inner());
        let refuse = self
            .rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(Status::unavailable("kubelet is not ready"));
        }
        Ok(Response::new(Empty {}))
    }
}

fn spawn_fake_kubelet(
    dir: &Path,
    rejections: usize,
) -> (JoinHandle<()>, mpsc::UnboundedReceiver<RegisterRequest>) {
    let listener =
        UnixListener::bind(dir.join(KUBELET_SOCKET_NAME)).expect("should bind kubelet socket");
    let (tx, rx) = mpsc::unbounded_channel();
    let server = Server::builder()
        .add_service(RegistrationServer::new(FakeKubelet {
            registrations: tx,
            rejections: AtomicUsize::new(rejections),
        }))
        .serve_with_incoming(UnixListenerStream::new(listener));

    let handle = tokio::spawn(async move {
        let _ = server.await;
    });
    (handle, rx)
}

fn context() -> Arc<PluginContext> {
    let inventory = Inventory {
        accelerator_ids: vec!["GPU-A".to_string(), "GPU-B".to_string()],
        slots_per_accelerator: NonZeroU32::new(2).expect("non-zero"),
        backend: Backend::Cuda,
        visibility_env: NVIDIA_VISIBLE_DEVICES.to_string(),
        exposure: Exposure::EnvVar,
    };
    PluginContext::new(RESOURCE_NAME, inventory, WorkloadPaths::default())
}

fn endpoint_config(dir: &Path) -> EndpointConfig {
    EndpointConfig {
        device_plugin_dir: dir.to_path_buf(),
        socket_name: SOCKET_NAME.to_string(),
        kubelet_socket_name: KUBELET_SOCKET_NAME.to_string(),
        dial_timeout: Duration::from_millis(500),
    }
}

async fn connect(socket_path: PathBuf) -> DevicePluginClient<Channel> {
    let channel = Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move { UnixStream::connect(socket_path).await.map(TokioIo::new) }
        }))
        .await
        .expect("should connect to plugin socket");
    DevicePluginClient::new(channel)
}

async fn next_registration(rx: &mut mpsc::UnboundedReceiver<RegisterRequest>) -> RegisterRequest {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("should register in time")
        .expect("fake kubelet should be running")
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn serves_registers_restarts_and_shuts_down() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let (_kubelet, mut registrations) = spawn_fake_kubelet(dir.path(), 0);

    let supervisor = Supervisor::new(context(), endpoint_config(dir.path()));
    let events = supervisor.events();
    let supervisor = tokio::spawn(supervisor.run());

    let registration = next_registration(&mut registrations).await;
    assert_eq!(registration.version, "v1beta1");
    assert_eq!(registration.endpoint, SOCKET_NAME);
    assert_eq!(registration.resource_name, RESOURCE_NAME);
    let options = registration.options.expect("should send options");
    assert!(options.get_preferred_allocation_available);
    assert!(!options.pre_start_required);

    let mut client = connect(dir.path().join(SOCKET_NAME)).await;

    let mut watch = client
        .list_and_watch(Empty {})
        .await
        .expect("should open device stream")
        .into_inner();
    let devices = watch
        .next()
        .await
        .expect("should get device list")
        .expect("should not be an error")
        .devices;
    let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["GPU-A__1", "GPU-A__2", "GPU-B__1", "GPU-B__2"]);

    let preferred = client
        .get_preferred_allocation(PreferredAllocationRequest {
            container_requests: vec![ContainerPreferredAllocationRequest {
                available_device_ids: strings(&["GPU-A__1", "GPU-A__2", "GPU-B__1", "GPU-B__2"]),
                must_include_device_ids: vec![],
                allocation_size: 3,
            }],
        })
        .await
        .expect("should prefer")
        .into_inner();
    assert_eq!(
        preferred.container_responses[0].device_ids,
        vec!["GPU-A__1", "GPU-A__2", "GPU-B__1"]
    );

    let allocated = client
        .allocate(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: strings(&["GPU-A__1", "GPU-B__2", "GPU-A__2"]),
            }],
        })
        .await
        .expect("should allocate")
        .into_inner();
    let envs = &allocated.container_responses[0].envs;
    assert_eq!(envs[NVIDIA_VISIBLE_DEVICES], "GPU-A,GPU-B");
    assert_eq!(envs["LD_PRELOAD"], "/usr/lib/libnvshare.so");

    let rejected = client
        .allocate(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: strings(&["GPU-C__1"]),
            }],
        })
        .await
        .expect_err("should reject unknown device");
    assert_eq!(rejected.code(), tonic::Code::InvalidArgument);

    events
        .send(SupervisorEvent::KubeletRestarted)
        .expect("supervisor should be running");
    let registration = next_registration(&mut registrations).await;
    assert_eq!(registration.resource_name, RESOURCE_NAME);

    let ended = tokio::time::timeout(Duration::from_secs(10), watch.next())
        .await
        .expect("old device stream should end on restart");
    assert!(ended.map_or(true, |item| item.is_err()));

    events
        .send(SupervisorEvent::Signal(Signal::Terminate))
        .expect("supervisor should be running");
    let result = tokio::time::timeout(Duration::from_secs(10), supervisor)
        .await
        .expect("should shut down in time")
        .expect("supervisor task should not panic");
    assert!(result.is_ok());
    assert!(!dir.path().join(SOCKET_NAME).exists());
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn retries_until_kubelet_appears() {
    let dir = tempfile::tempdir().expect("should create temp dir");

    let supervisor = Supervisor::new(context(), endpoint_config(dir.path()));
    let events = supervisor.events();
    let supervisor = tokio::spawn(supervisor.run());

    tokio::time::sleep(Duration::from_secs(1)).await;
    let (_kubelet, mut registrations) = spawn_fake_kubelet(dir.path(), 0);

    let registration = next_registration(&mut registrations).await;
    assert_eq!(registration.endpoint, SOCKET_NAME);
    assert!(dir.path().join(SOCKET_NAME).exists());

    events
        .send(SupervisorEvent::Signal(Signal::Interrupt))
        .expect("supervisor should be running");
    let result = tokio::time::timeout(Duration::from_secs(10), supervisor)
        .await
        .expect("should shut down in time")
        .expect("supervisor task should not panic");
    assert!(result.is_ok());
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn superseded_start_failure_does_not_restart_healthy_endpoint() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let (_kubelet, mut registrations) = spawn_fake_kubelet(dir.path(), 1);

    let supervisor = Supervisor::new(context(), endpoint_config(dir.path()));
    let events = supervisor.events();
    // queued ahead of the failure of the first start
    events
        .send(SupervisorEvent::KubeletRestarted)
        .expect("supervisor should be alive");
    let supervisor = tokio::spawn(supervisor.run());

    // first start is refused, the queued restart registers successfully
    next_registration(&mut registrations).await;
    next_registration(&mut registrations).await;

    let extra = tokio::time::timeout(Duration::from_secs(2), registrations.recv()).await;
    assert!(extra.is_err(), "healthy endpoint should not be restarted again");
    assert!(dir.path().join(SOCKET_NAME).exists());

    events
        .send(SupervisorEvent::Signal(Signal::Terminate))
        .expect("supervisor should be running");
    let result = tokio::time::timeout(Duration::from_secs(10), supervisor)
        .await
        .expect("should shut down in time")
        .expect("supervisor task should not panic");
    assert!(result.is_ok());
}
