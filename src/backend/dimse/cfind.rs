use super::association::pool::{AssociationPool, PoolError, PresentationParameter};
use super::association::AssociationError;
use super::{
	next_message_id, DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError,
	StatusType, WriteError, DATA_SET_EXISTS,
};
use crate::types::{Priority, QueryInformationModel, UI, US};
use async_stream::try_stream;
use async_trait::async_trait;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use futures::{Stream, TryStreamExt};
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

const COMMAND_FIELD_COMPOSITE_FIND_REQUEST: US = 0x0020;

/// C-FIND-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-2>
pub struct CompositeFindRequest {
	pub message_id: US,
	pub priority: US,
	pub affected_sop_class_uid: UI,
	pub identifier: InMemDicomObject,
}

impl From<CompositeFindRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeFindRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self { command, data: Some(request.identifier) }
	}
}

/// C-FIND-RSP
#[derive(Debug)]
pub struct CompositeFindResponse {
	pub status: US,
	pub data: Option<InMemDicomObject>,
}

impl TryFrom<DicomMessage> for CompositeFindResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let status = message
			.command
			.get(tags::STATUS)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.ok_or(ReadError::MissingAttribute(tags::STATUS))?;

		Ok(Self {
			status,
			data: message.data,
		})
	}
}

pub struct FindServiceClassUserOptions {
	pub query_information_model: QueryInformationModel,
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: Priority,
}

impl From<FindServiceClassUserOptions> for CompositeFindRequest {
	fn from(options: FindServiceClassUserOptions) -> Self {
		Self {
			identifier: options.identifier,
			message_id: options.message_id,
			priority: options.priority as US,
			affected_sop_class_uid: UI::from(options.query_information_model.as_sop_class()),
		}
	}
}

pub struct FindServiceClassUser {
	pool: AssociationPool,
	timeout: Duration,
}

impl FindServiceClassUser {
	pub const fn new(pool: AssociationPool, timeout: Duration) -> Self {
		Self { pool, timeout }
	}

	/// Sends a C-FIND-RQ and yields the identifier of every pending response.
	pub fn invoke(
		&self,
		options: FindServiceClassUserOptions,
	) -> impl Stream<Item = Result<InMemDicomObject, FindError>> + Send + '_ {
		let presentation = PresentationParameter {
			abstract_syntax_uid: UI::from(options.query_information_model.as_sop_class()),
			transfer_syntax_uids: vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
		};

		try_stream! {
			let association = self.pool.get(presentation).await?;
			association.write_message(CompositeFindRequest::from(options), self.timeout).await?;
			trace!("Sent C-FIND-RQ");

			loop {
				let response = association.read_message(self.timeout).await?;
				let response = CompositeFindResponse::try_from(response)?;
				trace!(status = response.status, "Received C-FIND-RSP");

				let status_type = StatusType::try_from(response.status)
					.unwrap_or(StatusType::Failure);
				match status_type {
					StatusType::Pending => {
						if let Some(data) = response.data {
							yield data;
						}
					}
					StatusType::Success | StatusType::Warning | StatusType::Cancel => break,
					StatusType::Failure => Err::<(), _>(FindError::Status(response.status))?,
				}
			}
		}
	}
}

/// Runs a Study Root C-FIND and collects the matching identifiers.
#[async_trait]
pub trait Finder: Send + Sync {
	async fn find(&self, identifier: InMemDicomObject) -> Result<Vec<InMemDicomObject>, FindError>;
}

#[async_trait]
impl Finder for FindServiceClassUser {
	async fn find(&self, identifier: InMemDicomObject) -> Result<Vec<InMemDicomObject>, FindError> {
		let options = FindServiceClassUserOptions {
			query_information_model: QueryInformationModel::Study,
			identifier,
			message_id: next_message_id(),
			priority: Priority::Medium,
		};
		self.invoke(options).try_collect().await
	}
}

#[derive(Debug, Error)]
pub enum FindError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] PoolError<AssociationError>),
	#[error("C-FIND failed with status {0:#06X}")]
	Status(US),
}
