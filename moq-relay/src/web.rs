use std::{net, sync::Arc};

use axum::{extract::State, response::IntoResponse, routing::get, Router};
use axum_server::tls_rustls::RustlsAcceptor;
use tokio::sync::RwLock;

pub struct WebConfig {
	pub bind: net::SocketAddr,
	pub tls: moq_native::tls::Config,
}

/// Serves the relay's certificate fingerprint over plain HTTPS so a browser
/// without a trusted CA chain can pin it before attempting the WebTransport
/// handshake.
// TODO remove this when browsers add support for self-signed certificates over WebTransport
pub struct Web {
	app: Router,
	server: axum_server::Server<RustlsAcceptor>,
}

struct Store {
	fingerprint: String,
}

impl Web {
	pub fn new(config: WebConfig) -> Self {
		let fingerprint = config.tls.fingerprints.first().expect("missing certificate").clone();

		let mut tls = config.tls.server.expect("missing server configuration");
		tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
		let tls = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(tls));

		let store = Arc::new(RwLock::new(Store { fingerprint }));

		let app = Router::new()
			.route("/fingerprint", get(serve_fingerprint))
			.with_state(store);

		let server = axum_server::bind_rustls(config.bind, tls);

		Self { app, server }
	}

	pub async fn run(self) -> anyhow::Result<()> {
		self.server.serve(self.app.into_make_service()).await?;
		Ok(())
	}
}

async fn serve_fingerprint(State(store): State<Arc<RwLock<Store>>>) -> impl IntoResponse {
	store.read().await.fingerprint.clone()
}
