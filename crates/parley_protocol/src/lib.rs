#![forbid(unsafe_code)]

pub mod framing;
pub mod frames;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_split_payload_from_buffer,
};
pub use frames::{
	AckFrame, AckStatus, AuthFrame, ChatFrame, ConnectedFrame, Envelope, ErrorFrame, GroupChatFrame, OfflineKind,
	OfflineSummaryFrame, PresenceFrame, ReadReceipt, ReadReport, kind,
};
