//! Plugin-side routing of tagged calls, driven with a raw gRPC client.

mod common;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::Request;

use common::memdb_factory;
use dbplugin::database::InMemoryDatabase;
use dbplugin::grpc::DatabaseDispatcher;
use dbplugin::plugin::negotiator::multiplexing_supported;
use dbplugin::plugin::PluginServer;
use dbplugin::proto::pb;
use dbplugin::proto::pb::database_client::DatabaseClient;

struct RunningPlugin {
    channel: Channel,
    dispatcher: Arc<DatabaseDispatcher>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for RunningPlugin {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn start(server: PluginServer) -> RunningPlugin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dispatcher = server.dispatcher();
    let (tx, rx) = oneshot::channel::<()>();

    tokio::spawn(server.serve_with_listener(listener, async {
        let _ = rx.await;
    }));

    let channel = Channel::from_shared(format!("http://{}", addr)).unwrap().connect().await.unwrap();
    RunningPlugin { channel, dispatcher, shutdown: Some(tx) }
}

fn tagged<T>(message: T, tag: &str) -> Request<T> {
    let mut request = Request::new(message);
    request.metadata_mut().insert("multiplex_id", MetadataValue::try_from(tag).unwrap());
    request
}

fn init_request() -> pb::InitializeRequest {
    pb::InitializeRequest { config_data: None, verify_connection: false }
}

#[tokio::test]
async fn untagged_call_is_rejected_by_multiplexed_dispatcher() {
    let plugin = start(PluginServer::new(DatabaseDispatcher::multiplexed(memdb_factory()))).await;
    let mut client = DatabaseClient::new(plugin.channel.clone());

    let status = client.get_type(pb::Empty {}).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert!(status.message().contains("multiplex_id"));
    assert_eq!(plugin.dispatcher.instance_count().await, 0);
}

#[tokio::test]
async fn each_tag_gets_its_own_instance() {
    let plugin = start(PluginServer::new(DatabaseDispatcher::multiplexed(memdb_factory()))).await;
    let mut client = DatabaseClient::new(plugin.channel.clone());

    client.initialize(tagged(init_request(), "AAAAAAAAAA")).await.unwrap();
    client.initialize(tagged(init_request(), "BBBBBBBBBB")).await.unwrap();
    // Repeated calls reuse the instance.
    client.get_type(tagged(pb::Empty {}, "AAAAAAAAAA")).await.unwrap();

    assert_eq!(
        plugin.dispatcher.session_ids().await,
        vec!["AAAAAAAAAA".to_string(), "BBBBBBBBBB".to_string()]
    );

    client.close(tagged(pb::Empty {}, "AAAAAAAAAA")).await.unwrap();
    assert_eq!(plugin.dispatcher.session_ids().await, vec!["BBBBBBBBBB".to_string()]);

    // Closing a tag that never made a call is fine.
    client.close(tagged(pb::Empty {}, "CCCCCCCCCC")).await.unwrap();
    assert_eq!(plugin.dispatcher.instance_count().await, 1);
}

#[tokio::test]
async fn users_do_not_leak_between_tags() {
    let plugin = start(PluginServer::new(DatabaseDispatcher::multiplexed(memdb_factory()))).await;
    let mut client = DatabaseClient::new(plugin.channel.clone());

    client.initialize(tagged(init_request(), "tenant-one")).await.unwrap();
    client.initialize(tagged(init_request(), "tenant-two")).await.unwrap();

    let created = client
        .new_user(tagged(
            pb::NewUserRequest {
                username_config: Some(pb::UsernameConfig {
                    display_name: "svc".into(),
                    role_name: "admin".into(),
                }),
                password: "s3cret".into(),
                expiration: Some(prost_types::Timestamp { seconds: 4_102_444_800, nanos: 0 }),
                statements: None,
                rollback_statements: None,
            },
            "tenant-one",
        ))
        .await
        .unwrap()
        .into_inner();

    let update = pb::UpdateUserRequest {
        username: created.username,
        password: Some(pb::ChangePassword { new_password: "rotated".into(), statements: None }),
        expiration: None,
    };
    let status = client.update_user(tagged(update.clone(), "tenant-two")).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert!(status.message().contains("unknown user"));

    client.update_user(tagged(update, "tenant-one")).await.unwrap();
}

#[tokio::test]
async fn single_dispatcher_ignores_tags() {
    let plugin = start(PluginServer::new(DatabaseDispatcher::single(InMemoryDatabase::new()))).await;
    let mut client = DatabaseClient::new(plugin.channel.clone());

    let untagged = client.get_type(pb::Empty {}).await.unwrap().into_inner();
    let tagged_resp = client.get_type(tagged(pb::Empty {}, "whatever")).await.unwrap().into_inner();
    assert_eq!(untagged.type_name, "memdb");
    assert_eq!(tagged_resp.type_name, "memdb");
    assert_eq!(plugin.dispatcher.instance_count().await, 1);
}

#[tokio::test]
async fn multiplexing_question_follows_the_server() {
    let multiplexed = start(PluginServer::new(DatabaseDispatcher::multiplexed(memdb_factory()))).await;
    assert!(multiplexing_supported(multiplexed.channel.clone()).await.unwrap());

    // No PluginMultiplexing service at all: the Unimplemented answer means no.
    let legacy = start(PluginServer::new(DatabaseDispatcher::single(InMemoryDatabase::new()))).await;
    assert!(!multiplexing_supported(legacy.channel.clone()).await.unwrap());

    let declined = start(
        PluginServer::new(DatabaseDispatcher::single(InMemoryDatabase::new()))
            .with_multiplexing_report(Some(false)),
    )
    .await;
    assert!(!multiplexing_supported(declined.channel.clone()).await.unwrap());
}
