use proptest::prelude::*;
use tdmtp_mtproto::{MsgIdGen, SeqNo, SessionData};

proptest! {
    #[test]
    fn msg_ids_only_grow(steps in prop::collection::vec((0u64..5_000, -3_600i32..3_600), 1..200)) {
        let mut ids = MsgIdGen::new();
        let mut now = 1_700_000_000_000u64;
        let mut last = 0i64;
        for (jump, offset) in steps {
            // The clock may also step back.
            now = if jump % 7 == 0 { now.saturating_sub(jump) } else { now + jump };
            let id = ids.next(now, offset);
            prop_assert_eq!(id & 3, 0);
            prop_assert!(id > last);
            last = id;
        }
        prop_assert_eq!(ids.last(), last);
    }

    #[test]
    fn seq_nos_count_content_messages(content in prop::collection::vec(any::<bool>(), 0..100)) {
        let mut seq = SeqNo::default();
        let mut sent = 0;
        for c in content {
            let n = seq.next(c);
            prop_assert_eq!(n, sent * 2 + i32::from(c));
            sent += i32::from(c);
        }
    }
}

#[test]
fn session_ids_follow_the_time_offset() {
    let data = SessionData::new().unwrap();
    let now = 1_700_000_000_000u64;
    let before = data.msgid(now);
    data.update_time(1_700_000_100, now);
    assert_eq!(data.time_offset(), 100);
    let after = data.msgid(now);
    assert_eq!(after >> 32, 1_700_000_100);
    assert!(after > before);
}
