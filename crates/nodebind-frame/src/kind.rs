use crate::error::FrameError;

/// What a frame carries.
///
/// A TRANSACTION is either a request or a successful reply; the direction is
/// implied by which side of the connection reads it. An EXCEPTION is always a
/// failed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FrameKind {
    Transaction = 1,
    Exception = 2,
}

impl FrameKind {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Transaction => "transaction",
            FrameKind::Exception => "exception",
        }
    }
}

impl TryFrom<i32> for FrameKind {
    type Error = FrameError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Transaction),
            2 => Ok(FrameKind::Exception),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
