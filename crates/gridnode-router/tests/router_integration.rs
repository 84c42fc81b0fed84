//! Router integration tests over real sockets.
//!
//! These drive the router exactly the way its peers do: a control channel
//! over the IPC socket, executor registrations, client connections over TCP,
//! and peer-node connections between two live routers.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use uuid::Uuid;

use gridnode_common::protocol::{
    Address, ClientConnectionStatus, ComputationStatusMessage, ControlMessage, Envelope,
    MessageClass, RegistrationData, RouterInfoMessage, SessionRoutingAction,
    SessionRoutingDataMessage, SessionStatusMessage,
};
use gridnode_common::transport::{read_frame, write_frame, write_registration};
use gridnode_router::{Router, RouterConfig};

const STEP: Duration = Duration::from_secs(5);

struct TestRouter {
    router: Router,
    node_id: Uuid,
    ipc_path: PathBuf,
    _dir: tempfile::TempDir,
}

async fn start_router(node_id: Uuid) -> TestRouter {
    let dir = tempfile::tempdir().unwrap();
    let ipc_path = dir.path().join("router.sock");
    let router = Router::start(RouterConfig::new(node_id, &ipc_path))
        .await
        .unwrap();
    TestRouter {
        router,
        node_id,
        ipc_path,
        _dir: dir,
    }
}

/// Connects the control channel and consumes the RouterInfo reply.
async fn connect_control(tr: &TestRouter) -> (UnixStream, u16) {
    let mut stream = UnixStream::connect(&tr.ipc_path).await.unwrap();
    write_registration(&mut stream, &RegistrationData::control(tr.node_id))
        .await
        .unwrap();
    let env = timeout(STEP, read_frame(&mut stream)).await.unwrap().unwrap();
    let info: RouterInfoMessage = env.unpack().unwrap();
    (stream, info.message_port)
}

async fn connect_executor(tr: &TestRouter, session: Uuid, comp: Uuid) -> UnixStream {
    let mut stream = UnixStream::connect(&tr.ipc_path).await.unwrap();
    write_registration(
        &mut stream,
        &RegistrationData::executor(session, comp, tr.node_id),
    )
    .await
    .unwrap();
    stream
}

async fn connect_client(port: u16, session: Uuid) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    write_registration(&mut stream, &RegistrationData::client(session))
        .await
        .unwrap();
    stream
}

/// Routing document for one session with one local computation.
fn routing_doc(session: Uuid, node: Uuid, port: u16, comp: Uuid, comp_name: &str) -> Value {
    json!({
        session.to_string(): {
            "nodes": {
                node.to_string(): {
                    "host": "localhost", "ip": "127.0.0.1", "tcp": port, "entry": true,
                },
            },
            "computations": {
                comp_name: {"compId": comp.to_string(), "nodeId": node.to_string()},
            },
        },
    })
}

async fn install_routing<S>(control: &mut S, session: Uuid, routing: &Value)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let msg = SessionRoutingDataMessage::with_routing(
        SessionRoutingAction::Initialize,
        session,
        routing.to_string(),
    );
    write_frame(control, &Envelope::pack(&msg).unwrap())
        .await
        .unwrap();
    let env = timeout(STEP, read_frame(control)).await.unwrap().unwrap();
    let ack: SessionRoutingDataMessage = env.unpack().unwrap();
    assert_eq!(ack.action, SessionRoutingAction::Acknowledge);
    assert_eq!(ack.session_id, session);
}

#[tokio::test]
async fn test_control_handshake_reports_port() {
    let tr = start_router(Uuid::new_v4()).await;
    let (_control, port) = connect_control(&tr).await;
    assert_eq!(port, tr.router.listen_port());
    assert_ne!(port, 0);
    tr.router.shutdown();
}

#[tokio::test]
async fn test_routing_install_acknowledged_and_executor_ready() {
    let tr = start_router(Uuid::new_v4()).await;
    let (mut control, port) = connect_control(&tr).await;

    let session = Uuid::new_v4();
    let comp = Uuid::new_v4();
    let routing = routing_doc(session, tr.node_id, port, comp, "render");
    install_routing(&mut control, session, &routing).await;

    // executor registration produces a "ready" notification on the control
    // channel
    let _executor = connect_executor(&tr, session, comp).await;
    let env = timeout(STEP, read_frame(&mut control)).await.unwrap().unwrap();
    assert_eq!(env.class, MessageClass::ComputationStatus);
    let status: ComputationStatusMessage = env.unpack().unwrap();
    assert_eq!(status.session_id, session);
    assert_eq!(status.computation_id, comp);
    assert_eq!(status.status, "ready");

    tr.router.shutdown();
}

#[tokio::test]
async fn test_control_message_routed_to_executor_in_order() {
    let tr = start_router(Uuid::new_v4()).await;
    let (mut control, port) = connect_control(&tr).await;

    let session = Uuid::new_v4();
    let comp = Uuid::new_v4();
    let routing = routing_doc(session, tr.node_id, port, comp, "render");
    install_routing(&mut control, session, &routing).await;

    let mut executor = connect_executor(&tr, session, comp).await;
    // drain the ready notification
    let _ = timeout(STEP, read_frame(&mut control)).await.unwrap().unwrap();

    // the service pre-addresses control messages; the router just routes
    for command in ["go", "update", "stop"] {
        let env = Envelope::pack(&ControlMessage::new(command, ""))
            .unwrap()
            .addressed_to(vec![Address::computation(session, tr.node_id, comp)]);
        write_frame(&mut control, &env).await.unwrap();
    }

    for expected in ["go", "update", "stop"] {
        let env = timeout(STEP, read_frame(&mut executor)).await.unwrap().unwrap();
        let msg: ControlMessage = env.unpack().unwrap();
        assert_eq!(msg.command, expected);
    }

    tr.router.shutdown();
}

#[tokio::test]
async fn test_stash_delivered_to_late_client_in_order() {
    let tr = start_router(Uuid::new_v4()).await;
    let (mut control, port) = connect_control(&tr).await;

    let session = Uuid::new_v4();
    let comp = Uuid::new_v4();
    let routing = routing_doc(session, tr.node_id, port, comp, "render");
    install_routing(&mut control, session, &routing).await;

    let mut executor = connect_executor(&tr, session, comp).await;
    let _ = timeout(STEP, read_frame(&mut control)).await.unwrap().unwrap();

    // the client has not connected yet: client-bound messages are stashed
    for tag in 0..3u32 {
        let env = Envelope {
            class: MessageClass::Application(tag),
            routing_name: "FrameMessage".to_string(),
            from: None,
            to: vec![Address::client(session)],
            payload: tag.to_be_bytes().to_vec(),
        };
        write_frame(&mut executor, &env).await.unwrap();
    }
    // give the router time to stash before the client attaches
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = connect_client(port, session).await;
    // the control channel learns the client connected
    let env = timeout(STEP, read_frame(&mut control)).await.unwrap().unwrap();
    let status: ClientConnectionStatus = env.unpack().unwrap();
    assert_eq!(status.reason, "connected");

    // stashed messages arrive first, in arrival order
    for tag in 0..3u32 {
        let env = timeout(STEP, read_frame(&mut client)).await.unwrap().unwrap();
        assert_eq!(env.class, MessageClass::Application(tag));
    }

    // a message sent after the client attached follows the stash
    let live = Envelope {
        class: MessageClass::Application(99),
        routing_name: "FrameMessage".to_string(),
        from: None,
        to: vec![Address::client(session)],
        payload: Vec::new(),
    };
    write_frame(&mut executor, &live).await.unwrap();
    let env = timeout(STEP, read_frame(&mut client)).await.unwrap().unwrap();
    assert_eq!(env.class, MessageClass::Application(99));

    tr.router.shutdown();
}

#[tokio::test]
async fn test_client_message_addressed_by_filter() {
    let tr = start_router(Uuid::new_v4()).await;
    let (mut control, port) = connect_control(&tr).await;

    let session = Uuid::new_v4();
    let comp = Uuid::new_v4();
    let routing = routing_doc(session, tr.node_id, port, comp, "render");
    install_routing(&mut control, session, &routing).await;

    let mut executor = connect_executor(&tr, session, comp).await;
    let _ = timeout(STEP, read_frame(&mut control)).await.unwrap().unwrap();

    let mut client = connect_client(port, session).await;
    let _ = timeout(STEP, read_frame(&mut control)).await.unwrap().unwrap();

    // client messages carry no destinations; the addresser fills them in
    let env = Envelope {
        class: MessageClass::Application(7),
        routing_name: "CameraMove".to_string(),
        from: None,
        to: Vec::new(),
        payload: vec![1, 2, 3],
    };
    write_frame(&mut client, &env).await.unwrap();

    let env = timeout(STEP, read_frame(&mut executor)).await.unwrap().unwrap();
    assert_eq!(env.class, MessageClass::Application(7));
    assert_eq!(env.to.len(), 1);
    assert_eq!(env.to[0].computation, Some(comp));

    tr.router.shutdown();
}

#[tokio::test]
async fn test_kick_delivers_final_status_and_closes() {
    let tr = start_router(Uuid::new_v4()).await;
    let (mut control, port) = connect_control(&tr).await;

    // a client for a session the router has never heard of: accepted
    // transiently so the final status can be delivered
    let session = Uuid::new_v4();
    let mut client = connect_client(port, session).await;

    let env = timeout(STEP, read_frame(&mut control)).await.unwrap().unwrap();
    let status: ClientConnectionStatus = env.unpack().unwrap();
    assert_eq!(status.reason, "connected");

    // the session manager answers with a kick
    let kick = ClientConnectionStatus {
        session_id: session,
        reason: "sessionDeleted".to_string(),
        session_status: json!({
            "disconnectReason": "sessionDeleted",
            "execStatus": "stopped",
            "execStoppedReason": "render complete",
        })
        .to_string(),
    };
    write_frame(&mut control, &Envelope::pack(&kick).unwrap())
        .await
        .unwrap();

    // the client sees the final session status, then the connection closes
    let env = timeout(STEP, read_frame(&mut client)).await.unwrap().unwrap();
    let status: SessionStatusMessage = env.unpack().unwrap();
    let parsed: Value = serde_json::from_str(&status.status_json).unwrap();
    assert_eq!(parsed["disconnectReason"], json!("sessionDeleted"));

    let end = timeout(STEP, read_frame(&mut client)).await.unwrap();
    assert!(end.is_err(), "connection should be closed after the kick");

    tr.router.shutdown();
}

#[tokio::test]
async fn test_duplicate_client_rejected() {
    let tr = start_router(Uuid::new_v4()).await;
    let (mut control, port) = connect_control(&tr).await;

    let session = Uuid::new_v4();
    let comp = Uuid::new_v4();
    let routing = routing_doc(session, tr.node_id, port, comp, "render");
    install_routing(&mut control, session, &routing).await;

    let _first = connect_client(port, session).await;
    let _ = timeout(STEP, read_frame(&mut control)).await.unwrap().unwrap();

    // second client for the same session is refused outright
    let mut second = connect_client(port, session).await;
    let end = timeout(STEP, read_frame(&mut second)).await.unwrap();
    assert!(end.is_err(), "duplicate client should be disconnected");

    tr.router.shutdown();
}

/// Two nodes route to each other simultaneously; both converge on a working
/// path and every message arrives exactly once.
#[tokio::test]
async fn test_node_to_node_simultaneous_connect() {
    // fixed ids so the greater/lesser relation is deterministic
    let node_a = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
    let node_b = Uuid::parse_str("00000000-0000-0000-0000-000000000002").unwrap();

    let ra = start_router(node_a).await;
    let rb = start_router(node_b).await;

    let (mut control_a, port_a) = connect_control(&ra).await;
    let (mut control_b, port_b) = connect_control(&rb).await;

    let session = Uuid::new_v4();
    let comp_a = Uuid::new_v4();
    let comp_b = Uuid::new_v4();

    let routing = json!({
        session.to_string(): {
            "nodes": {
                node_a.to_string(): {
                    "host": "localhost", "ip": "127.0.0.1", "tcp": port_a, "entry": true,
                },
                node_b.to_string(): {
                    "host": "localhost", "ip": "127.0.0.1", "tcp": port_b,
                },
            },
            "computations": {
                "ca": {"compId": comp_a.to_string(), "nodeId": node_a.to_string()},
                "cb": {"compId": comp_b.to_string(), "nodeId": node_b.to_string()},
            },
        },
    });

    install_routing(&mut control_a, session, &routing).await;
    install_routing(&mut control_b, session, &routing).await;

    let mut exec_a = connect_executor(&ra, session, comp_a).await;
    let mut exec_b = connect_executor(&rb, session, comp_b).await;
    let _ = timeout(STEP, read_frame(&mut control_a)).await.unwrap().unwrap();
    let _ = timeout(STEP, read_frame(&mut control_b)).await.unwrap().unwrap();

    // both sides dial at the same moment: A's computation sends to B's
    // while B's sends to A's
    let app = |tag: u32, to: Address| Envelope {
        class: MessageClass::Application(tag),
        routing_name: "SimData".to_string(),
        from: None,
        to: vec![to],
        payload: Vec::new(),
    };
    let to_b = app(1, Address::computation(session, node_b, comp_b));
    let to_a = app(2, Address::computation(session, node_a, comp_a));
    let (sent_a, sent_b) = tokio::join!(
        write_frame(&mut exec_a, &to_b),
        write_frame(&mut exec_b, &to_a),
    );
    sent_a.unwrap();
    sent_b.unwrap();

    // each message arrives exactly once, whichever side won the race
    let env = timeout(STEP, read_frame(&mut exec_b)).await.unwrap().unwrap();
    assert_eq!(env.class, MessageClass::Application(1));
    let env = timeout(STEP, read_frame(&mut exec_a)).await.unwrap().unwrap();
    assert_eq!(env.class, MessageClass::Application(2));

    // and traffic keeps flowing afterwards across the settled connection
    let again = app(3, Address::computation(session, node_b, comp_b));
    write_frame(&mut exec_a, &again).await.unwrap();
    let env = timeout(STEP, read_frame(&mut exec_b)).await.unwrap().unwrap();
    assert_eq!(env.class, MessageClass::Application(3));

    // no duplicate deliveries lurking
    let extra = timeout(Duration::from_millis(300), read_frame(&mut exec_a)).await;
    assert!(extra.is_err(), "no duplicate message expected on node A");

    ra.router.shutdown();
    rb.router.shutdown();
}

#[tokio::test]
async fn test_routing_delete_clears_stash() {
    let tr = start_router(Uuid::new_v4()).await;
    let (mut control, port) = connect_control(&tr).await;

    let session = Uuid::new_v4();
    let comp = Uuid::new_v4();
    let routing = routing_doc(session, tr.node_id, port, comp, "render");
    install_routing(&mut control, session, &routing).await;

    let mut executor = connect_executor(&tr, session, comp).await;
    let _ = timeout(STEP, read_frame(&mut control)).await.unwrap().unwrap();

    // stash a message, then delete the session's routing
    let env = Envelope {
        class: MessageClass::Application(1),
        routing_name: "FrameMessage".to_string(),
        from: None,
        to: vec![Address::client(session)],
        payload: Vec::new(),
    };
    write_frame(&mut executor, &env).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let delete = SessionRoutingDataMessage::new(SessionRoutingAction::Delete, session);
    write_frame(&mut control, &Envelope::pack(&delete).unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // a client connecting now is the late-client case: no routing data, so
    // nothing stashed is delivered
    let mut client = connect_client(port, session).await;
    let _ = timeout(STEP, read_frame(&mut control)).await.unwrap().unwrap();
    let got = timeout(Duration::from_millis(300), read_frame(&mut client)).await;
    assert!(got.is_err(), "stash should have been cleared by delete");

    tr.router.shutdown();
}
