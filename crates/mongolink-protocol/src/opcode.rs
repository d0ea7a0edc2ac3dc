//! Wire protocol opcodes

use mongolink_common::FrameError;

/// MongoDB wire protocol opcodes understood by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,          // Legacy
    Update = 2001,      // Legacy
    Insert = 2002,      // Legacy
    Query = 2004,       // Legacy
    GetMore = 2005,     // Legacy
    Delete = 2006,      // Legacy
    KillCursors = 2007, // Legacy
    Msg = 2013,         // Current
}

impl OpCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for OpCode {
    type Error = FrameError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OpCode::Reply),
            2001 => Ok(OpCode::Update),
            2002 => Ok(OpCode::Insert),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            2013 => Ok(OpCode::Msg),
            other => Err(FrameError::UnknownOpCode(other)),
        }
    }
}
