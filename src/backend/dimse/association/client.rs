use super::{AskPattern, Association, AssociationError, ChannelError, Command};
use dicom::ul::pdu::{PDataValueType, PresentationContextNegotiated};
use dicom::ul::Pdu;
use std::convert::identity;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

type UlAssociation = dicom::ul::ClientAssociation<TcpStream>;

pub struct ClientAssociation {
	channel: Sender<Command>,
	uuid: Uuid,
	tcp_stream: TcpStream,
	presentation_contexts: Vec<PresentationContextNegotiated>,
}

pub struct ClientAssociationOptions {
	pub calling_aet: String,
	pub called_aet: String,
	pub abstract_syntax: String,
	pub transfer_syntaxes: Vec<String>,
	pub address: SocketAddr,
}

impl ClientAssociation {
	/// Sends a PDU, splitting data sets that exceed the maximum PDU length of the acceptor.
	fn chunked_send(association: &mut UlAssociation, pdu: &Pdu) -> Result<(), AssociationError> {
		if let Pdu::PData { data } = pdu {
			let is_command = data
				.first()
				.is_some_and(|pdv| pdv.value_type == PDataValueType::Command);
			let data_length: usize = data.iter().map(|pdv| pdv.data.len()).sum();

			if !is_command && data_length > association.acceptor_max_pdu_length() as usize {
				for pdv in data {
					let mut writer = association.send_pdata(pdv.presentation_context_id);
					writer
						.write_all(&pdv.data)
						.map_err(AssociationError::ChunkWriter)?;
				}
				return Ok(());
			}
		}
		association.send(pdu).map_err(AssociationError::from)
	}

	pub async fn new(options: ClientAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let address = options.address;
		let thread_name = format!("{}-client", options.called_aet);
		let ul_options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(options.calling_aet)
			.called_ae_title(options.called_aet)
			.with_presentation_context(options.abstract_syntax, options.transfer_syntaxes);

		thread::Builder::new()
			.name(thread_name)
			.spawn(move || {
				let mut association = match ul_options.establish(address) {
					Ok(mut association) => {
						let presentation_contexts = association.presentation_contexts().to_vec();
						let stream = association.inner_stream().try_clone();
						match stream {
							Ok(stream) => {
								if connect_tx.send(Ok((stream, presentation_contexts))).is_err() {
									return;
								}
							}
							Err(err) => {
								let _ = connect_tx.send(Err(AssociationError::OsThread(err)));
								return;
							}
						}
						association
					}
					Err(err) => {
						error!(backend_uuid = uuid.to_string(), "Failed to connect: {err}");
						let _ = connect_tx.send(Err(err.into()));
						return;
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let replied = match command {
						Command::Send(pdu, reply_to) => reply_to
							.send(Self::chunked_send(&mut association, &pdu))
							.map_err(|_| ChannelError::Closed),
						Command::Receive(reply_to) => reply_to
							.send(association.receive().map_err(AssociationError::from))
							.map_err(|_| ChannelError::Closed),
					};
					if let Err(err) = replied {
						error!(
							backend_uuid = uuid.to_string(),
							"Error in client association: {err}"
						);
						break;
					}
				}

				rx.close();
				if let Err(err) = association.abort() {
					debug!(
						backend_uuid = uuid.to_string(),
						"Failed to abort client association: {err}"
					);
				}
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts) = connect_result
			.await
			.map_err(|_| AssociationError::Channel(ChannelError::Closed))??;

		Ok(Self {
			channel: tx,
			uuid,
			tcp_stream,
			presentation_contexts,
		})
	}

	pub const fn uuid(&self) -> &Uuid {
		&self.uuid
	}
}

impl Drop for ClientAssociation {
	fn drop(&mut self) {
		self.close();
	}
}

impl Association for ClientAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			debug!(
				backend_uuid = self.uuid.to_string(),
				"Failed to shut down TcpStream: {err}"
			);
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}
}
