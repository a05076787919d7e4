use std::fs;
use std::io;
use std::io::BufReader;
use std::sync::Arc;

use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::future::BoxFuture;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;

use crate::config::Settings;
use crate::error::{KmeError, Result};

/// Builds the `rustls::ServerConfig` the gateway listens with: the server's
/// own identity (`server_cert_file`/`server_key_file`) plus a client
/// verifier that only accepts certificates chained to `ca_file`. This is
/// the enforcement point the doc comment on [`MtlsAcceptor`] refers to —
/// a connection whose client cert doesn't chain to `ca_file` never reaches
/// [`MtlsAcceptor::accept`] at all.
pub async fn server_acceptor(settings: &Settings) -> Result<MtlsAcceptor> {
    let mut roots = RootCertStore::empty();
    let ca_raw = fs::read(&settings.ca_file)
        .map_err(|e| KmeError::Fatal(format!("could not read ca_file {}: {}", settings.ca_file, e)))?;
    for cert in rustls_pemfile::certs(&mut BufReader::new(ca_raw.as_slice())) {
        let cert = cert.map_err(|e| KmeError::Fatal(format!("could not parse ca_file: {}", e)))?;
        roots
            .add(cert)
            .map_err(|e| KmeError::Fatal(format!("could not trust ca_file entry: {}", e)))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| KmeError::Fatal(format!("could not build client verifier: {}", e)))?;

    let cert_raw = fs::read(&settings.server_cert_file).map_err(|e| {
        KmeError::Fatal(format!("could not read server_cert_file {}: {}", settings.server_cert_file, e))
    })?;
    let chain: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_raw.as_slice()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| KmeError::Fatal(format!("could not parse server_cert_file: {}", e)))?;

    let key_raw = fs::read(&settings.server_key_file).map_err(|e| {
        KmeError::Fatal(format!("could not read server_key_file {}: {}", settings.server_key_file, e))
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_raw.as_slice()))
        .map_err(|e| KmeError::Fatal(format!("could not parse server_key_file: {}", e)))?
        .ok_or_else(|| KmeError::Fatal("server_key_file contains no private key".to_string()))?;

    let server_config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|e| KmeError::Fatal(format!("could not build TLS server config: {}", e)))?;

    let config = RustlsConfig::from_config(Arc::new(server_config));
    Ok(MtlsAcceptor::new(RustlsAcceptor::new(config)))
}

/// The leaf certificate (raw DER) a peer presented during the mTLS
/// handshake, attached to the request so handlers can resolve it against
/// the [`crate::identity::IdentityStore`] without touching the socket.
#[derive(Debug, Clone)]
pub struct PeerCertificate(pub Arc<Vec<u8>>);

/// Wraps [`RustlsAcceptor`] to surface the client's leaf certificate after
/// the handshake completes, since `axum-server` does not expose it on its
/// own. The certificate is attached as a request extension by
/// [`ClientCertService`]; `rustls` itself already refused the connection
/// if no client certificate chained to `ca_file` was presented (mTLS is
/// enforced by `WebPkiClientVerifier`, configured where the acceptor is
/// built), so its absence here only means an anonymous TLS client reached
/// an endpoint that does not require one.
#[derive(Clone)]
pub struct MtlsAcceptor {
    inner: RustlsAcceptor,
}

impl MtlsAcceptor {
    pub fn new(inner: RustlsAcceptor) -> Self {
        Self { inner }
    }
}

impl<I, S> Accept<I, S> for MtlsAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = ClientCertService<S>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();

        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;

            let peer_der = stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| Arc::new(cert.as_ref().to_vec()));

            Ok((stream, ClientCertService { inner: service, peer_der }))
        })
    }
}

/// Inserts the handshake's [`PeerCertificate`] (if any) as a request
/// extension before delegating to the wrapped service.
#[derive(Clone)]
pub struct ClientCertService<S> {
    inner: S,
    peer_der: Option<Arc<Vec<u8>>>,
}

impl<S, ReqBody> tower::Service<http::Request<ReqBody>> for ClientCertService<S>
where
    S: tower::Service<http::Request<ReqBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        if let Some(der) = &self.peer_der {
            req.extensions_mut().insert(PeerCertificate(der.clone()));
        }

        self.inner.call(req)
    }
}
