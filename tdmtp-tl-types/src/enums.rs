//! Boxed types: one enum per TL result type, dispatching on the constructor id.

use crate::types;

tl_enum! {
    ResPq { ResPq(types::ResPq) }
}

tl_enum! {
    ServerDhParams {
        Fail(types::ServerDhParamsFail),
        Ok(types::ServerDhParamsOk),
    }
}

tl_enum! {
    ServerDhInnerData { ServerDhInnerData(types::ServerDhInnerData) }
}

tl_enum! {
    SetClientDhParamsAnswer {
        DhGenOk(types::DhGenOk),
        DhGenRetry(types::DhGenRetry),
        DhGenFail(types::DhGenFail),
    }
}

tl_enum! {
    Pong { Pong(types::Pong) }
}

tl_enum! {
    MsgDetailedInfo {
        MsgDetailedInfo(types::MsgDetailedInfo),
        MsgNewDetailedInfo(types::MsgNewDetailedInfo),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deserialize::Error;
    use crate::{Deserializable, Serializable};

    #[test]
    fn dispatches_on_constructor() {
        let retry = types::DhGenRetry {
            nonce: [1; 16],
            server_nonce: [2; 16],
            new_nonce_hash2: [3; 16],
        };
        let bytes = retry.to_bytes();
        assert_eq!(
            SetClientDhParamsAnswer::from_bytes(&bytes).unwrap(),
            SetClientDhParamsAnswer::DhGenRetry(retry)
        );
    }

    #[test]
    fn unknown_constructor_is_reported() {
        let bytes = 0xdeadbeefu32.to_bytes();
        assert_eq!(
            ServerDhParams::from_bytes(&bytes),
            Err(Error::UnexpectedConstructor { id: 0xdeadbeef })
        );
    }
}
