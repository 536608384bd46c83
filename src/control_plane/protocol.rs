//! Fixed-size IPC message format (`spec.md` §6 "IPC message format",
//! §4.9 opcode table).

use zerocopy::{AsBytes, FromBytes};

use crate::param::NVFUSE_IPC_MSG_SIZE;

const NAME_FIELD_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Opcode {
    AppRegister = 1,
    AppUnregister = 2,
    SuperblockCopy = 3,
    BufferAlloc = 4,
    BufferFree = 5,
    ContainerAlloc = 6,
    ContainerRelease = 7,
    ContainerReservationAcquire = 8,
    ContainerReservationRelease = 9,
    HealthCheck = 10,
}

impl Opcode {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            1 => Self::AppRegister,
            2 => Self::AppUnregister,
            3 => Self::SuperblockCopy,
            4 => Self::BufferAlloc,
            5 => Self::BufferFree,
            6 => Self::ContainerAlloc,
            7 => Self::ContainerRelease,
            8 => Self::ContainerReservationAcquire,
            9 => Self::ContainerReservationRelease,
            10 => Self::HealthCheck,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReservationMode {
    Read = 0,
    Write = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReservationStatus {
    Unlocked = 0,
    Acquired = 1,
    ReadLocked = 2,
    WriteLocked = 3,
}

/// 128-byte fixed IPC message (`spec.md` §6): `{opcode, chan_id, ret}`
/// header, followed by opcode-specific fields. Every opcode's payload is
/// folded into one struct since the wire format is a "128-byte fixed
/// union" — unused fields for a given opcode are simply ignored.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct IpcMessage {
    pub opcode: i32,
    pub chan_id: i32,
    pub ret: i32,
    pub core_id: u32,
    pub bg_id: u32,
    pub mode: i32,
    // `n` is 8-byte aligned and sits right after six 4-byte fields (offset
    // 24), so no implicit padding is inserted — `AsBytes`/`FromBytes`
    // reject any repr(C) layout that would need one.
    pub n: u64,
    pub name: [u8; NAME_FIELD_SIZE],
    _pad: [u8; NVFUSE_IPC_MSG_SIZE - 4 * 6 - 8 - NAME_FIELD_SIZE],
}

static_assertions::const_assert_eq!(core::mem::size_of::<IpcMessage>(), NVFUSE_IPC_MSG_SIZE);

impl Default for IpcMessage {
    fn default() -> Self {
        Self {
            opcode: 0,
            chan_id: 0,
            ret: 0,
            core_id: 0,
            bg_id: 0,
            mode: 0,
            n: 0,
            name: [0; NAME_FIELD_SIZE],
            _pad: [0; NVFUSE_IPC_MSG_SIZE - 4 * 6 - 8 - NAME_FIELD_SIZE],
        }
    }
}

impl IpcMessage {
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_i32(self.opcode)
    }

    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(NAME_FIELD_SIZE - 1);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name[len..].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_exactly_one_wire_frame() {
        assert_eq!(core::mem::size_of::<IpcMessage>(), NVFUSE_IPC_MSG_SIZE);
    }

    #[test]
    fn name_round_trips_through_the_fixed_field() {
        let mut msg = IpcMessage::default();
        msg.set_name("secondary-a");
        assert_eq!(msg.name_str(), "secondary-a");
    }
}
