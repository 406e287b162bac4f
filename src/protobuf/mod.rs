//! Generated protobuf modules
//!
//! Bindings for the Meshtastic serial API are generated by `build.rs` from the
//! `.proto` files under `protos/meshtastic` when the `meshtastic-proto` feature is
//! enabled. The schema is treated as an external, versioned wire contract; this module
//! only adds a few helpers for the messages that cross the serial link.

#[cfg(feature = "meshtastic-proto")]
pub mod meshtastic_generated {
    //! Generated Meshtastic protobuf types.
    //! prost emits one file per package (meshtastic.rs); the include is wrapped so the
    //! unused parts of the schema do not flood the build with warnings.
    #[allow(dead_code, unused_imports, unused_variables, unused_mut, unused_macros)]
    #[allow(clippy::all)]
    #[allow(rustdoc::invalid_html_tags)]
    mod inner {
        include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
    }
    pub use inner::*;
}

#[cfg(feature = "meshtastic-proto")]
pub use codec::*;

#[cfg(feature = "meshtastic-proto")]
mod codec {
    use super::meshtastic_generated as proto;
    use bytes::Bytes;
    use prost::Message;

    /// Destination address meaning "every node on the channel".
    pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

    pub fn encode_to_radio(msg: &proto::ToRadio) -> Vec<u8> {
        msg.encode_to_vec()
    }

    pub fn decode_from_radio(payload: &[u8]) -> Result<proto::FromRadio, prost::DecodeError> {
        proto::FromRadio::decode(payload)
    }

    pub fn decode_to_radio(payload: &[u8]) -> Result<proto::ToRadio, prost::DecodeError> {
        proto::ToRadio::decode(payload)
    }

    /// Wrap a mesh packet in the ToRadio envelope.
    pub fn to_radio_packet(packet: proto::MeshPacket) -> proto::ToRadio {
        proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::Packet(packet)),
        }
    }

    pub fn to_radio_want_config(id: u32) -> proto::ToRadio {
        proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::WantConfigId(id)),
        }
    }

    pub fn to_radio_heartbeat(nonce: u32) -> proto::ToRadio {
        proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::Heartbeat(
                proto::Heartbeat { nonce },
            )),
        }
    }

    /// Build a decoded (unencrypted) mesh packet for the given port.
    pub fn data_packet(
        id: u32,
        to: u32,
        channel: u32,
        port: proto::PortNum,
        payload: impl Into<Bytes>,
        want_ack: bool,
    ) -> proto::MeshPacket {
        proto::MeshPacket {
            to,
            id,
            channel,
            want_ack,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: port as i32,
                payload: payload.into(),
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    /// Decoded data section of a packet, if it was not delivered encrypted.
    pub fn packet_data(packet: &proto::MeshPacket) -> Option<&proto::Data> {
        match packet.payload_variant.as_ref() {
            Some(proto::mesh_packet::PayloadVariant::Decoded(d)) => Some(d),
            _ => None,
        }
    }

}

#[cfg(not(feature = "meshtastic-proto"))]
pub mod meshtastic_generated {
    //! Stub implementations when protobufs are not compiled.
    #[derive(Debug, Clone)]
    pub struct Placeholder {
        pub note: String,
    }
}
