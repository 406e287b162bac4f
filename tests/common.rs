//! Test utilities & fixtures.
//! A scripted radio that sits on the far side of a `PipeTransport` and answers the
//! handshake, acks and admin requests the way firmware does.
#![cfg(feature = "meshtastic-proto")]
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use prost::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use meshlink::meshtastic::framer::{Frame, FrameBuilder, FrameParser, FrameSink};
use meshlink::meshtastic::{PipeRemote, PipeTransport, StreamConnection, StreamSettings};
use meshlink::protobuf::meshtastic_generated as proto;
use meshlink::protobuf::{data_packet, packet_data};

use proto::admin_message::PayloadVariant as Admin;
use proto::from_radio::PayloadVariant as FromRadio;
use proto::to_radio::PayloadVariant as ToRadio;

pub const RADIO_NODE: u32 = 0x0a0b_0c0d;

/// How the fake radio reacts to host traffic.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub answer_config: bool,
    pub ack_packets: bool,
    pub answer_admin: bool,
    /// Sent as plain text right before the configuration stream.
    pub boot_log: Option<String>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            answer_config: true,
            ack_packets: true,
            answer_admin: true,
            boot_log: None,
        }
    }
}

enum Cmd {
    Feed(Vec<u8>),
    HangUp,
}

pub struct FakeRadio {
    cmd: mpsc::UnboundedSender<Cmd>,
    seen: Arc<Mutex<Vec<proto::ToRadio>>>,
    task: JoinHandle<()>,
}

impl FakeRadio {
    pub fn spawn(mut remote: PipeRemote, behavior: Behavior) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let task = tokio::spawn(async move {
            let mut parser = FrameParser::new();
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(Cmd::Feed(bytes)) => remote.feed(&bytes),
                        Some(Cmd::HangUp) => remote.hang_up(),
                        None => break,
                    },
                    chunk = remote.next_write() => {
                        let Some(chunk) = chunk else { break };
                        let mut frames = Frames::default();
                        parser.feed(&chunk, &mut frames);
                        for frame in frames.0 {
                            let Ok(msg) = frame.decode_to_radio() else { continue };
                            log.lock().unwrap().push(msg.clone());
                            for reply in respond(&behavior, msg) {
                                remote.feed(&reply);
                            }
                        }
                    }
                }
            }
        });
        Self {
            cmd: cmd_tx,
            seen,
            task,
        }
    }

    /// Push raw bytes to the host, as if the radio had written them.
    pub fn feed(&self, bytes: &[u8]) {
        let _ = self.cmd.send(Cmd::Feed(bytes.to_vec()));
    }

    pub fn send(&self, msg: &proto::FromRadio) {
        self.feed(&frame(msg));
    }

    pub fn hang_up(&self) {
        let _ = self.cmd.send(Cmd::HangUp);
    }

    pub fn seen(&self) -> Vec<proto::ToRadio> {
        self.seen.lock().unwrap().clone()
    }

    /// Poll until `pred` holds for the messages seen so far, or two seconds pass.
    pub async fn wait_for<F>(&self, pred: F) -> bool
    where
        F: Fn(&[proto::ToRadio]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if pred(&self.seen.lock().unwrap()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

impl Drop for FakeRadio {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct Frames(Vec<Frame>);

impl FrameSink for Frames {
    fn on_frame(&mut self, frame: Frame) {
        self.0.push(frame);
    }
    fn on_log_byte(&mut self, _byte: u8) {}
}

pub fn frame(msg: &proto::FromRadio) -> Vec<u8> {
    FrameBuilder::new()
        .build_frame(&msg.encode_to_vec())
        .expect("frame fits")
}

pub fn from_radio(v: FromRadio) -> proto::FromRadio {
    proto::FromRadio {
        id: 0,
        payload_variant: Some(v),
    }
}

pub fn radio_user() -> proto::User {
    proto::User {
        id: format!("!{RADIO_NODE:08x}"),
        long_name: "Fake Radio".into(),
        short_name: "FAKE".into(),
        ..Default::default()
    }
}

fn config_stream(id: u32) -> Vec<proto::FromRadio> {
    vec![
        from_radio(FromRadio::MyInfo(proto::MyNodeInfo {
            my_node_num: RADIO_NODE,
            ..Default::default()
        })),
        from_radio(FromRadio::NodeInfo(proto::NodeInfo {
            num: RADIO_NODE,
            user: Some(radio_user()),
            ..Default::default()
        })),
        from_radio(FromRadio::Metadata(proto::DeviceMetadata {
            firmware_version: "2.3.0-fake".into(),
            ..Default::default()
        })),
        from_radio(FromRadio::Channel(proto::Channel {
            index: 0,
            role: proto::channel::Role::Primary as i32,
            ..Default::default()
        })),
        from_radio(FromRadio::Config(proto::Config {
            payload_variant: Some(proto::config::PayloadVariant::Lora(
                proto::config::LoRaConfig {
                    hop_limit: 3,
                    ..Default::default()
                },
            )),
        })),
        from_radio(FromRadio::ConfigCompleteId(id)),
    ]
}

/// A packet from the radio that answers `request_id`.
pub fn reply_packet(port: proto::PortNum, payload: Vec<u8>, request_id: u32) -> proto::MeshPacket {
    let mut pkt = data_packet(rand::random::<u32>().max(1), 0, 0, port, payload, false);
    pkt.from = RADIO_NODE;
    if let Some(proto::mesh_packet::PayloadVariant::Decoded(d)) = pkt.payload_variant.as_mut() {
        d.request_id = request_id;
    }
    pkt
}

fn respond(behavior: &Behavior, msg: proto::ToRadio) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    match msg.payload_variant {
        Some(ToRadio::WantConfigId(id)) if behavior.answer_config => {
            if let Some(text) = &behavior.boot_log {
                out.push(text.clone().into_bytes());
            }
            let mut stream = Vec::new();
            for m in config_stream(id) {
                stream.extend(frame(&m));
            }
            out.push(stream);
        }
        Some(ToRadio::Packet(pkt)) => {
            let Some(data) = packet_data(&pkt) else {
                return out;
            };
            if data.portnum == proto::PortNum::AdminApp as i32 && behavior.answer_admin {
                let req = proto::AdminMessage::decode(&data.payload[..]).ok();
                if let Some(Admin::GetOwnerRequest(_)) = req.and_then(|r| r.payload_variant) {
                    let resp = proto::AdminMessage {
                        payload_variant: Some(Admin::GetOwnerResponse(radio_user())),
                    };
                    let reply =
                        reply_packet(proto::PortNum::AdminApp, resp.encode_to_vec(), pkt.id);
                    out.push(frame(&from_radio(FromRadio::Packet(reply))));
                }
            }
            if pkt.want_ack && behavior.ack_packets {
                let routing = proto::Routing {
                    variant: Some(proto::routing::Variant::ErrorReason(0)),
                };
                let ack = reply_packet(proto::PortNum::RoutingApp, routing.encode_to_vec(), pkt.id);
                out.push(frame(&from_radio(FromRadio::Packet(ack))));
            }
        }
        _ => {}
    }
    out
}

/// Settings tuned so handshakes and timeouts resolve quickly in tests.
pub fn fast_settings() -> StreamSettings {
    StreamSettings {
        config_timeout: Duration::from_secs(2),
        admin_timeout: Duration::from_secs(2),
        wake_settle: Duration::from_millis(5),
        ..StreamSettings::default()
    }
}

/// A connection wired to a fake radio; not yet connected.
pub fn fake_link(behavior: Behavior, settings: StreamSettings) -> (StreamConnection, FakeRadio) {
    let (transport, remote) = PipeTransport::pair("fake0");
    let conn = StreamConnection::new(Box::new(transport), "fake0", settings);
    (conn, FakeRadio::spawn(remote, behavior))
}
