//! One accepted controller connection.
//!
//! Owns the per-connection handshake state machines and the session
//! cipher, and routes decrypted requests to the right handler. The
//! transport feeds requests in; event pushes go out through the sink.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hap_pairing::{PairSetupServer, PairVerifyServer, PairingsController};

use crate::characteristics::CharacteristicsController;
use crate::context::ServerContext;
use crate::http::{HttpRequest, HttpResponse, Method};
use crate::session::{Session, SessionPhase};
use crate::traits::{EventConnection, TransportSink};

pub struct Connection {
    id: u64,
    // Handed to the subscription table when this connection subscribes
    self_ref: Weak<Connection>,
    context: Arc<ServerContext>,
    session: Mutex<Session>,
    pair_setup: Mutex<PairSetupServer>,
    pair_verify: Mutex<PairVerifyServer>,
    characteristics: CharacteristicsController,
    pairings: PairingsController,
    sink: Arc<dyn TransportSink>,
}

impl Connection {
    pub fn new(context: Arc<ServerContext>, sink: Arc<dyn TransportSink>) -> Arc<Self> {
        let id = context.next_connection_id();
        tracing::debug!(conn = id, "connection accepted");
        Arc::new_cyclic(|self_ref| Self {
            id,
            self_ref: self_ref.clone(),
            session: Mutex::new(Session::new()),
            pair_setup: Mutex::new(PairSetupServer::new(Arc::clone(&context.auth))),
            pair_verify: Mutex::new(PairVerifyServer::new(Arc::clone(&context.auth))),
            characteristics: CharacteristicsController::new(
                Arc::clone(&context.registry),
                Arc::clone(&context.subscriptions),
            ),
            pairings: PairingsController::new(Arc::clone(&context.auth)),
            sink,
            context,
        })
    }

    pub fn connection_id(&self) -> u64 {
        self.id
    }

    /// Process one request and produce the response for the transport.
    ///
    /// Never returns an error: malformed input maps to 400, everything
    /// else to 500, so the connection stays usable.
    pub async fn handle_request(&self, request: HttpRequest) -> HttpResponse {
        // Whether session crypto applies is fixed before dispatch, so
        // the pair-verify M4 response goes out in plaintext even though
        // the session is verified by the time it is sent.
        let was_verified = self.session().is_verified();

        let request = if was_verified && !request.body.is_empty() {
            // Bind before matching so the session guard drops before close()
            let decrypted = self.session().decrypt(&request.body);
            match decrypted {
                Ok(plain) => HttpRequest {
                    body: plain,
                    ..request
                },
                Err(e) => {
                    tracing::warn!(conn = self.id, error = %e, "request decrypt failed");
                    self.close();
                    return HttpResponse::internal_error();
                }
            }
        } else {
            request
        };

        let mut response = self.dispatch(&request, was_verified).await;

        if was_verified && !response.body.is_empty() {
            let sealed = self.session().encrypt(&response.body);
            match sealed {
                Ok(sealed) => response.body = sealed,
                Err(e) => {
                    tracing::warn!(conn = self.id, error = %e, "response encrypt failed");
                    self.close();
                    return HttpResponse::internal_error();
                }
            }
        }
        response
    }

    async fn dispatch(&self, request: &HttpRequest, was_verified: bool) -> HttpResponse {
        match (request.method, request.path.as_str()) {
            (Method::Post, "/pair-setup") => self.handle_pair_setup(&request.body),
            (Method::Post, "/pair-verify") => self.handle_pair_verify(&request.body),
            _ if !was_verified && !self.context.allows_unauthenticated() => {
                tracing::debug!(conn = self.id, path = %request.path, "unauthenticated request rejected");
                HttpResponse::not_found()
            }
            (Method::Get, "/accessories") => self.characteristics.snapshot().await,
            (Method::Get, "/characteristics") => {
                self.characteristics.get(request.query.as_deref()).await
            }
            (Method::Put, "/characteristics") => {
                let as_event_target: Arc<dyn EventConnection> = match self.self_ref.upgrade() {
                    Some(strong) => strong,
                    None => return HttpResponse::internal_error(),
                };
                self.characteristics
                    .put(&request.body, &as_event_target)
                    .await
            }
            (Method::Post, "/pairings") => self.handle_pairings(&request.body),
            _ => HttpResponse::not_found(),
        }
    }

    fn handle_pair_setup(&self, body: &[u8]) -> HttpResponse {
        let result = {
            let mut engine = lock(&self.pair_setup);
            engine.handle(body)
        };
        match result {
            Ok(output) => {
                if let Some(controller_id) = output.completed {
                    tracing::info!(conn = self.id, controller = %controller_id, "pair-setup completed");
                    if let Err(e) = self.context.advertiser.set_discoverable(false) {
                        tracing::warn!(error = %e, "could not update advertisement after pairing");
                    }
                } else {
                    self.session().set_phase(SessionPhase::PairSetup);
                }
                HttpResponse::ok_tlv(output.body)
            }
            Err(e) => {
                tracing::warn!(conn = self.id, error = %e, "malformed pair-setup request");
                HttpResponse::bad_request()
            }
        }
    }

    fn handle_pair_verify(&self, body: &[u8]) -> HttpResponse {
        let result = {
            let mut engine = lock(&self.pair_verify);
            engine.handle(body)
        };
        match result {
            Ok(output) => {
                // Response first: M4 travels in plaintext, the keys take
                // effect from the next request.
                let response = HttpResponse::ok_tlv(output.body);
                match output.completed {
                    Some(verified) => {
                        tracing::info!(conn = self.id, controller = %verified.controller_id, "session verified");
                        self.session().activate(verified.controller_id, &verified.keys);
                    }
                    None => self.session().set_phase(SessionPhase::PairVerify),
                }
                response
            }
            Err(e) => {
                tracing::warn!(conn = self.id, error = %e, "malformed pair-verify request");
                HttpResponse::bad_request()
            }
        }
    }

    fn handle_pairings(&self, body: &[u8]) -> HttpResponse {
        let requester_id = match self.session().controller_id() {
            Some(id) => id.to_string(),
            None => {
                tracing::warn!(conn = self.id, "pairings request without verified controller");
                return HttpResponse::not_found();
            }
        };
        match self.pairings.handle(&requester_id, body) {
            Ok(output) => {
                if output.unpaired {
                    tracing::info!("last pairing removed, advertising as unpaired");
                    if let Err(e) = self.context.advertiser.set_discoverable(true) {
                        tracing::warn!(error = %e, "could not update advertisement after unpairing");
                    }
                }
                HttpResponse::ok_tlv(output.body)
            }
            Err(e) => {
                tracing::warn!(conn = self.id, error = %e, "malformed pairings request");
                HttpResponse::bad_request()
            }
        }
    }

    /// Tear down the connection: drop subscriptions and key material.
    pub fn close(&self) {
        self.context.subscriptions.remove_connection(self.id);
        self.session().close();
        tracing::debug!(conn = self.id, "connection closed");
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }
}

impl EventConnection for Connection {
    fn id(&self) -> u64 {
        self.id
    }

    fn can_receive_events(&self) -> bool {
        self.session().is_verified()
    }

    fn push_event(&self, body: Vec<u8>) {
        let sealed = {
            let mut session = self.session();
            if !session.is_verified() {
                return;
            }
            match session.encrypt(&body) {
                Ok(sealed) => sealed,
                Err(e) => {
                    tracing::debug!(conn = self.id, error = %e, "event encrypt failed, dropping");
                    return;
                }
            }
        };
        self.sink.send(sealed);
    }
}

// Session state survives a panicked holder
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
