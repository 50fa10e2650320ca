use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use quinn::{ClientConfig, Endpoint, ServerConfig};
use rcgen::generate_simple_self_signed;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::{Result, ServiceError};
use crate::protocol::Message;

const SERVER_NAME: &str = "landrop-local";

/// Length-delimited JSON frames over one direction of a QUIC stream.
pub type FrameWriter = FramedWrite<quinn::SendStream, LengthDelimitedCodec>;
pub type FrameReader = FramedRead<quinn::RecvStream, LengthDelimitedCodec>;

pub fn frame_writer(send: quinn::SendStream) -> FrameWriter {
    FramedWrite::new(send, LengthDelimitedCodec::new())
}

pub fn frame_reader(recv: quinn::RecvStream) -> FrameReader {
    FramedRead::new(recv, LengthDelimitedCodec::new())
}

pub async fn write_message(writer: &mut FrameWriter, msg: &Message) -> Result<()> {
    let data = serde_json::to_vec(msg)?;
    writer
        .send(Bytes::from(data))
        .await
        .map_err(|e| ServiceError::Transport(e.to_string()))
}

/// Next message on the stream; Ok(None) when the peer finished it.
pub async fn read_message(reader: &mut FrameReader) -> Result<Option<Message>> {
    match reader.next().await {
        Some(frame) => {
            let frame = frame.map_err(|e| ServiceError::Transport(e.to_string()))?;
            Ok(Some(serde_json::from_slice(&frame)?))
        }
        None => Ok(None),
    }
}

#[derive(Clone)]
pub struct Transport {
    pub endpoint: Endpoint,
}

impl Transport {
    pub fn new(port: u16) -> Result<Self> {
        // Idempotent; quinn pulls in a second rustls provider, so the choice
        // must be pinned before the first endpoint is built
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let (cert_der, key_der) = generate_self_signed_cert()?;
        let server_config = configure_server(cert_der, key_der)?;
        let client_config = configure_client()?;

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let mut endpoint = Endpoint::server(server_config, addr)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self { endpoint })
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<quinn::Connection> {
        Ok(self.endpoint.connect(addr, SERVER_NAME)?.await?)
    }

    /// Open a fresh bidirectional stream to `addr`, send one message and
    /// finish the stream. Used for control messages (connect, disconnect).
    pub async fn send_message(&self, addr: SocketAddr, msg: &Message) -> Result<()> {
        let connection = self.connect(addr).await?;
        let (send, _recv) = connection
            .open_bi()
            .await
            .map_err(ServiceError::from)?;
        let mut writer = frame_writer(send);
        write_message(&mut writer, msg).await?;
        let mut send = writer.into_inner();
        send.finish()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        // Dropping the connection discards unsent data; wait until the peer
        // has taken (or stopped) the stream before letting it go
        let _ = send.stopped().await;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Close the endpoint and wait until its sockets are released.
    pub async fn shutdown(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
        self.endpoint.wait_idle().await;
    }
}

fn generate_self_signed_cert() -> Result<(Vec<u8>, Vec<u8>)> {
    let cert = generate_simple_self_signed(vec![SERVER_NAME.into()])
        .map_err(|e| ServiceError::Transport(e.to_string()))?;
    Ok((cert.cert.der().to_vec(), cert.signing_key.serialize_der()))
}

fn configure_server(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<ServerConfig> {
    let cert = rustls::pki_types::CertificateDer::from(cert_der);
    let key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
        .map_err(|_| ServiceError::Transport("Invalid private key".into()))?;

    let server_config = ServerConfig::with_single_cert(vec![cert], key)
        .map_err(|e| ServiceError::Transport(e.to_string()))?;
    Ok(server_config)
}

fn configure_client() -> Result<ClientConfig> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    // Every instance generates its own self-signed cert; peers are on the
    // same LAN and identified at the application layer, so the TLS identity
    // check is skipped.
    #[derive(Debug)]
    struct SkipServerVerification;
    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    let client_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    let quic_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_config)
            .map_err(|e| ServiceError::Transport(e.to_string()))?,
    ));

    Ok(quic_config)
}
