//! The DICOM network backend.
//!
//! Archives are searched with C-FIND over pooled client associations. Idle
//! associations are checked with C-ECHO before they are reused.

pub mod association;
mod cecho;
mod cfind;
mod source;

pub use cfind::FindError;
pub use source::DimseSource;

use crate::types::{UI, US};
use association::{Association, AssociationError};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType, PresentationContextNegotiated};
use dicom::ul::Pdu;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

/// Value of (0000,0800) for a message that carries a data set.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Value of (0000,0800) for a message without data set.
pub const DATA_SET_MISSING: US = 0x0101;

/// A DIMSE message: a command set followed by an optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	pub command: InMemDicomObject,
	pub data: Option<InMemDicomObject>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command, data }}")
		} else {
			write!(f, "DicomMessage {{ command }}")
		}
	}
}

/// Status types of DIMSE responses.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl TryFrom<u16> for StatusType {
	type Error = u16;

	fn try_from(value: u16) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0x0100..=0x01FF | 0x0200..=0x02FF => Ok(Self::Failure),
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Box<Pdu>),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute {0} is missing")]
	MissingAttribute(Tag),
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Failed to negotiate a presentation context")]
	NoPresentationContext,
}

pub trait DicomMessageReader {
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError>;
}

pub trait DicomMessageWriter {
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		timeout: Duration,
	) -> Result<(), WriteError>;
}

fn find_presentation_context(
	contexts: &[PresentationContextNegotiated],
	id: Option<u8>,
) -> Result<&PresentationContextNegotiated, NegotiationError> {
	match id {
		None => contexts.first(),
		Some(id) => contexts.iter().find(|pctx| pctx.id == id),
	}
	.ok_or(NegotiationError::NoPresentationContext)
}

impl<A: Association> DicomMessageWriter for A {
	#[instrument(skip_all)]
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		timeout: Duration,
	) -> Result<(), WriteError> {
		let message: DicomMessage = message.into();
		let presentation_context = find_presentation_context(self.presentation_contexts(), None)?;

		let mut command_buf = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;
		self.send(
			Pdu::PData {
				data: vec![PDataValue {
					value_type: PDataValueType::Command,
					presentation_context_id: presentation_context.id,
					is_last: true,
					data: command_buf,
				}],
			},
			timeout,
		)
		.await?;

		if let Some(data) = message.data {
			let transfer_syntax = TransferSyntaxRegistry
				.get(&presentation_context.transfer_syntax)
				.ok_or_else(|| {
					NegotiationError::UnknownTransferSyntax(UI::from(
						&presentation_context.transfer_syntax,
					))
				})?;
			let mut data_buf = Vec::new();
			data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;

			self.send(
				Pdu::PData {
					data: vec![PDataValue {
						value_type: PDataValueType::Data,
						presentation_context_id: presentation_context.id,
						is_last: true,
						data: data_buf,
					}],
				},
				timeout,
			)
			.await?;
		}

		Ok(())
	}
}

impl<A: Association> DicomMessageReader for A {
	#[instrument(skip_all)]
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let mut command_fragments = Vec::new();
		let mut data_fragments = Vec::new();
		let mut command: Option<InMemDicomObject> = None;

		loop {
			let pdu = self.receive(timeout).await?;
			let Pdu::PData { data } = pdu else {
				return Err(ReadError::UnexpectedPdu(Box::new(pdu)));
			};

			for mut pdv in data {
				match pdv.value_type {
					PDataValueType::Command => {
						trace!("Received command fragment (last={})", pdv.is_last);
						if command.is_some() {
							return Err(ReadError::OutOfOrder);
						}
						command_fragments.append(&mut pdv.data);
						if pdv.is_last {
							let command_set = InMemDicomObject::read_dataset_with_ts(
								command_fragments.as_slice(),
								&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
							)?;
							let has_data_set = command_set
								.get(tags::COMMAND_DATA_SET_TYPE)
								.map(InMemElement::to_int::<US>)
								.and_then(Result::ok)
								.is_some_and(|value| value != DATA_SET_MISSING);

							if !has_data_set {
								return Ok(DicomMessage {
									command: command_set,
									data: None,
								});
							}
							command = Some(command_set);
						}
					}
					PDataValueType::Data => {
						trace!("Received data fragment (last={})", pdv.is_last);
						data_fragments.append(&mut pdv.data);
						if pdv.is_last {
							let Some(command) = command else {
								return Err(ReadError::OutOfOrder);
							};
							let presentation_context = find_presentation_context(
								self.presentation_contexts(),
								Some(pdv.presentation_context_id),
							)?;
							let transfer_syntax = TransferSyntaxRegistry
								.get(&presentation_context.transfer_syntax)
								.ok_or_else(|| {
									NegotiationError::UnknownTransferSyntax(UI::from(
										&presentation_context.transfer_syntax,
									))
								})?;
							let data = InMemDicomObject::read_dataset_with_ts(
								data_fragments.as_slice(),
								transfer_syntax,
							)?;

							return Ok(DicomMessage {
								command,
								data: Some(data),
							});
						}
					}
				}
			}
		}
	}
}

/// Returns a new message id by incrementing a global counter.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(0);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst)
}
