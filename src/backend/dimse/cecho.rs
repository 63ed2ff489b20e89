use super::association::client::ClientAssociation;
use super::{
	next_message_id, DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType,
	WriteError, DATA_SET_MISSING,
};
use crate::types::US;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

const COMMAND_FIELD_COMPOSITE_ECHO_REQUEST: US = 0x0030;

/// C-ECHO-RQ
struct CompositeEchoRequest {
	message_id: US,
}

impl From<CompositeEchoRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeEchoRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
		]);

		Self { command, data: None }
	}
}

/// Reads the Status attribute of a C-ECHO-RSP.
fn echo_status(message: &DicomMessage) -> Result<US, ReadError> {
	message
		.command
		.get(tags::STATUS)
		.map(InMemElement::to_int::<US>)
		.and_then(Result::ok)
		.ok_or(ReadError::MissingAttribute(tags::STATUS))
}

/// Service class user for the Verification SOP class, used to probe pooled associations.
pub struct EchoServiceClassUser<'a> {
	association: &'a ClientAssociation,
}

impl<'a> EchoServiceClassUser<'a> {
	pub const fn new(association: &'a ClientAssociation) -> Self {
		Self { association }
	}

	/// Returns whether the peer answered with a success status.
	#[instrument(skip_all)]
	pub async fn echo(&self, timeout: Duration) -> Result<bool, EchoError> {
		let request = CompositeEchoRequest {
			message_id: next_message_id(),
		};
		self.association.write_message(request, timeout).await?;

		let response = self.association.read_message(timeout).await?;
		let status = echo_status(&response)?;
		let status_type = StatusType::try_from(status).unwrap_or(StatusType::Failure);

		debug!(status, "Received C-ECHO-RSP ({status_type:?})");
		Ok(status_type == StatusType::Success)
	}
}

#[derive(Debug, Error)]
pub enum EchoError {
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Read(#[from] ReadError),
}
