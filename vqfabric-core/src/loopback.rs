//! Loopback Simulator (spec.md section 4.6, feature `loopback`): a synthetic
//! command handler driven synchronously from `SQ.push` when a PCI test
//! device stands in for real firmware, so the upper stack can be exercised
//! without it.

use vqfabric_abi::CommonHeader;

use crate::dma::{MSG_ID_DATA_READ_RSP, MSG_ID_DATA_WRITE_RSP, STATUS_COMPLETE};
use crate::error::{DriverError, Result};
use crate::vq::VqSet;

/// Known command/response `msg_id` pairs. The core otherwise never
/// interprets message payloads; this table only exists because the
/// simulator has to stand in for firmware that would.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Echo,
    GetCompatibility,
    GetFirmwareVersion,
    DataRead,
    DataWrite,
    KernelLaunch,
    KernelAbort,
}

impl Command {
    const ECHO_CMD: u16 = 0x0001;
    const ECHO_RSP: u16 = 0x8001;
    const GET_COMPAT_CMD: u16 = 0x0002;
    const GET_COMPAT_RSP: u16 = 0x8002;
    const GET_FW_VERSION_CMD: u16 = 0x0003;
    const GET_FW_VERSION_RSP: u16 = 0x8003;
    const DATA_READ_CMD: u16 = 0x0004;
    const DATA_READ_RSP: u16 = MSG_ID_DATA_READ_RSP;
    const DATA_WRITE_CMD: u16 = 0x0005;
    const DATA_WRITE_RSP: u16 = MSG_ID_DATA_WRITE_RSP;
    const KERNEL_LAUNCH_CMD: u16 = 0x0006;
    const KERNEL_LAUNCH_RSP: u16 = 0x8006;
    const KERNEL_ABORT_CMD: u16 = 0x0007;
    const KERNEL_ABORT_RSP: u16 = 0x8007;

    fn from_msg_id(msg_id: u16) -> Option<Self> {
        Some(match msg_id {
            Self::ECHO_CMD => Self::Echo,
            Self::GET_COMPAT_CMD => Self::GetCompatibility,
            Self::GET_FW_VERSION_CMD => Self::GetFirmwareVersion,
            Self::DATA_READ_CMD => Self::DataRead,
            Self::DATA_WRITE_CMD => Self::DataWrite,
            Self::KERNEL_LAUNCH_CMD => Self::KernelLaunch,
            Self::KERNEL_ABORT_CMD => Self::KernelAbort,
            _ => return None,
        })
    }

    fn response_msg_id(self) -> u16 {
        match self {
            Self::Echo => Self::ECHO_RSP,
            Self::GetCompatibility => Self::GET_COMPAT_RSP,
            Self::GetFirmwareVersion => Self::GET_FW_VERSION_RSP,
            Self::DataRead => Self::DATA_READ_RSP,
            Self::DataWrite => Self::DATA_WRITE_RSP,
            Self::KernelLaunch => Self::KERNEL_LAUNCH_RSP,
            Self::KernelAbort => Self::KERNEL_ABORT_RSP,
        }
    }
}

/// Builds the canonical response payload for each known command
/// (spec.md section 4.6: "echo, compatibility {0,1,0}, firmware version
/// {1,0,0}, data-read/write completion, kernel-launch completion,
/// kernel-abort success").
fn response_payload(command: Command, request_payload: &[u8]) -> Vec<u8> {
    match command {
        Command::Echo => request_payload.to_vec(),
        Command::GetCompatibility => vec![0, 1, 0],
        Command::GetFirmwareVersion => vec![1, 0, 0],
        Command::DataRead | Command::DataWrite | Command::KernelLaunch | Command::KernelAbort => {
            vec![STATUS_COMPLETE]
        }
    }
}

fn synthesize_response(header: CommonHeader, request_payload: &[u8]) -> Result<(CommonHeader, Vec<u8>)> {
    let command = Command::from_msg_id(header.msg_id)
        .ok_or_else(|| DriverError::InvalidArgument(format!("unknown loopback command {}", header.msg_id)))?;
    let payload = response_payload(command, request_payload);
    let response_header = CommonHeader {
        size: (CommonHeader::SIZE + payload.len()) as u16,
        tag_id: header.tag_id,
        msg_id: command.response_msg_id(),
    };
    Ok((response_header, payload))
}

/// Peeks the just-pushed framed message, synthesizes its response, and
/// injects it into the corresponding CQ (spec.md section 4.2 step 4:
/// "in loopback mode, directly drive a synthetic command handler").
///
/// SQ/CQ pairing is positional: the response for `sq_index` lands on the CQ
/// of the same index, clamped to the node's CQ count.
pub fn drive(vq: &VqSet, sq_index: usize, message: &[u8]) -> Result<()> {
    let header = CommonHeader::from_bytes(message)
        .ok_or_else(|| DriverError::InvalidArgument("malformed loopback command header".into()))?;
    let framed_len = (header.size as usize).min(message.len());
    let request_payload = &message[CommonHeader::SIZE..framed_len];

    let (response_header, response_payload) = synthesize_response(header, request_payload)?;

    let cq_index = sq_index.min(vq.cqs.len().saturating_sub(1));
    vq.cq(cq_index)?.push_loopback_response(response_header, response_payload);
    Ok(())
}
