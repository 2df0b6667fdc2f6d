//! RPC functions of the service schema and the generic invoke wrappers.

use crate::{enums, Blob, Identifiable, RemoteCall, Serializable};

tl_function! {
    /// `req_pq#60469778 nonce:int128 = ResPQ`
    ReqPq = 0x60469778 { nonce: [u8; 16] } -> enums::ResPq
}

tl_function! {
    ReqDhParams = 0xd712e4be {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        p: Vec<u8>,
        q: Vec<u8>,
        public_key_fingerprint: i64,
        encrypted_data: Vec<u8>,
    } -> enums::ServerDhParams
}

tl_function! {
    SetClientDhParams = 0xf5045f1f {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_data: Vec<u8>,
    } -> enums::SetClientDhParamsAnswer
}

tl_function! {
    Ping = 0x7abe77ec { ping_id: i64 } -> enums::Pong
}

tl_function! {
    /// Ping that also asks the server to drop the connection after
    /// `disconnect_delay` seconds without another ping.
    PingDelayDisconnect = 0xf3427b8c { ping_id: i64, disconnect_delay: i32 } -> enums::Pong
}

tl_function! {
    /// Long-poll keeper for the HTTP transport. All values are milliseconds.
    HttpWait = 0x9299359f { max_delay: i32, wait_after: i32, max_wait: i32 } -> Blob
}

// ─── Generic wrappers ────────────────────────────────────────────────────────
//
// `{X:Type} ... query:!X = X`: the wrapped query is written as is, and the
// call returns whatever the query returns.

/// `invokeAfterMsg#cb9f372d {X:Type} msg_id:long query:!X = X`
#[derive(Clone, Debug, PartialEq)]
pub struct InvokeAfterMsg<X> {
    pub msg_id: i64,
    pub query: X,
}

/// `invokeWithLayer#da9b0d0d {X:Type} layer:int query:!X = X`
#[derive(Clone, Debug, PartialEq)]
pub struct InvokeWithLayer<X> {
    pub layer: i32,
    pub query: X,
}

/// `initConnection#69796de9 {X:Type} api_id:int device_model:string
/// system_version:string app_version:string lang_code:string query:!X = X`
#[derive(Clone, Debug, PartialEq)]
pub struct InitConnection<X> {
    pub api_id: i32,
    pub device_model: String,
    pub system_version: String,
    pub app_version: String,
    pub lang_code: String,
    pub query: X,
}

impl<X> Identifiable for InvokeAfterMsg<X> {
    const CONSTRUCTOR_ID: u32 = 0xcb9f372d;
}

impl<X> Identifiable for InvokeWithLayer<X> {
    const CONSTRUCTOR_ID: u32 = 0xda9b0d0d;
}

impl<X> Identifiable for InitConnection<X> {
    const CONSTRUCTOR_ID: u32 = 0x69796de9;
}

impl<X: Serializable> Serializable for InvokeAfterMsg<X> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.msg_id.serialize(buf);
        self.query.serialize(buf);
    }
}

impl<X: Serializable> Serializable for InvokeWithLayer<X> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.layer.serialize(buf);
        self.query.serialize(buf);
    }
}

impl<X: Serializable> Serializable for InitConnection<X> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.api_id.serialize(buf);
        self.device_model.serialize(buf);
        self.system_version.serialize(buf);
        self.app_version.serialize(buf);
        self.lang_code.serialize(buf);
        self.query.serialize(buf);
    }
}

impl<X: RemoteCall> RemoteCall for InvokeAfterMsg<X> {
    type Return = X::Return;
}

impl<X: RemoteCall> RemoteCall for InvokeWithLayer<X> {
    type Return = X::Return;
}

impl<X: RemoteCall> RemoteCall for InitConnection<X> {
    type Return = X::Return;
}
