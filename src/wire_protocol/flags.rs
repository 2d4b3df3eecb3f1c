//! Bit vectors carried by OP_QUERY and OP_REPLY. Only the bits that matter
//! for commands are named; unknown bits are dropped when decoding.
bitflags! {
    pub struct OpReplyFlags: i32 {
        const CURSOR_NOT_FOUND = 1;
        /// The single returned document is an `$err` document.
        const QUERY_FAILURE = 1 << 1;
        const AWAIT_CAPABLE = 1 << 3;
    }
}

bitflags! {
    pub struct OpQueryFlags: i32 {
        /// Lets the command run on a secondary.
        const SLAVE_OK = 1 << 2;
    }
}

impl OpQueryFlags {
    /// Monitoring commands target one specific instance, whatever its role.
    pub fn for_command() -> OpQueryFlags {
        OpQueryFlags::SLAVE_OK
    }
}
