//! TL serialization and the MTProto service schema.
//!
//! The schema surface is small and changes rarely, so it is maintained by
//! hand with the [`tl_object!`] / [`tl_enum!`] macros instead of being
//! generated from `.tl` files. Everything above the service layer travels as
//! opaque, already-serialized bytes ([`Blob`]).
//!
//! # Overview
//!
//! | Module        | Contents                                                   |
//! |---------------|------------------------------------------------------------|
//! | [`types`]     | Concrete constructors (bare types) as `struct`s            |
//! | [`functions`] | RPC functions as `struct`s implementing [`RemoteCall`]     |
//! | [`enums`]     | Boxed types as `enum`s implementing [`Deserializable`]     |
//!
//! ```rust
//! use tdmtp_tl_types::{functions, Serializable};
//!
//! let req = functions::ReqPq { nonce: [7; 16] };
//! let bytes = req.to_bytes();
//! assert_eq!(&bytes[..4], &0x60469778u32.to_le_bytes());
//! ```

#![deny(unsafe_code)]
#![allow(clippy::large_enum_variant)]

#[macro_use]
mod macros;

pub mod deserialize;
pub mod enums;
pub mod functions;
pub mod serialize;
pub mod types;

pub use deserialize::{Cursor, Deserializable};
pub use serialize::Serializable;

/// The API layer announced through `invokeWithLayer`.
pub const LAYER: i32 = 57;

/// Constructor id of the boxed `Vector` type.
pub const VECTOR_ID: u32 = 0x1cb5c415;

/// Bare vector: `vector` (lowercase) as opposed to the boxed `Vector`.
///
/// Used in rare cases where the server sends a length-prefixed list without
/// the usual `0x1cb5c415` constructor ID header.
#[derive(Clone, Debug, PartialEq)]
pub struct RawVec<T>(pub Vec<T>);

/// Opaque blob of bytes that should be passed through without interpretation.
///
/// Used for generic `!X` queries and for results whose type is decided by
/// the caller.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Blob(pub Vec<u8>);

impl From<Vec<u8>> for Blob {
    fn from(v: Vec<u8>) -> Self { Self(v) }
}

// ─── Core traits ──────────────────────────────────────────────────────────────

/// Every schema type has a unique 32-bit constructor ID.
pub trait Identifiable {
    /// The constructor ID as specified in the TL schema.
    const CONSTRUCTOR_ID: u32;
}

/// Marks a function type that can be sent to the server as an RPC call.
///
/// `Return` is the type the server will respond with.
pub trait RemoteCall: Serializable {
    /// The deserialized response type.
    type Return: Deserializable;
}

/// Returns the TL name for a known service constructor ID.
///
/// Used for log lines; unknown ids (regular API objects) return `None`.
pub fn name_for_id(id: u32) -> Option<&'static str> {
    Some(match id {
        0x05162463 => "resPQ",
        0x83c95aec => "p_q_inner_data",
        0x79cb045d => "server_DH_params_fail",
        0xd0e8075c => "server_DH_params_ok",
        0xb5890dba => "server_DH_inner_data",
        0x6643b654 => "client_DH_inner_data",
        0x3bcbf734 => "dh_gen_ok",
        0x46dc1fb9 => "dh_gen_retry",
        0xa69dae02 => "dh_gen_fail",
        0x60469778 => "req_pq",
        0xd712e4be => "req_DH_params",
        0xf5045f1f => "set_client_DH_params",
        0x62d6b459 => "msgs_ack",
        0xa7eff811 => "bad_msg_notification",
        0xedab447b => "bad_server_salt",
        0xda69fb52 => "msgs_state_req",
        0x04deb57d => "msgs_state_info",
        0x8cc0d131 => "msgs_all_info",
        0x276d3ec6 => "msg_detailed_info",
        0x809db6df => "msg_new_detailed_info",
        0x7d861a08 => "msg_resend_req",
        0xf35c6d01 => "rpc_result",
        0x2144ca19 => "rpc_error",
        0x347773c5 => "pong",
        0x7abe77ec => "ping",
        0xf3427b8c => "ping_delay_disconnect",
        0x9ec20908 => "new_session_created",
        0x73f1f8dc => "msg_container",
        0x3072cfa1 => "gzip_packed",
        0x9299359f => "http_wait",
        0xcb9f372d => "invokeAfterMsg",
        0xda9b0d0d => "invokeWithLayer",
        0x69796de9 => "initConnection",
        VECTOR_ID => "vector",
        _ => return None,
    })
}
