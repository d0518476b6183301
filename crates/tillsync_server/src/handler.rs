//! Request handlers for sync messages.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::gateway::BroadcastGateway;
use std::sync::Arc;
use tillsync_engine::{NewSession, SyncEngine, SyncError};
use tillsync_protocol::{
    BatchStatus, ResolveConflictRequest, ServerMessage, SyncRequest, SyncResponse, SyncResult,
};
use tracing::{debug, error, info};

/// Maps [`SyncRequest`]s onto engine calls.
pub struct RequestHandler {
    engine: Arc<SyncEngine>,
    gateway: Arc<BroadcastGateway>,
    max_upload_changes: usize,
}

impl RequestHandler {
    /// Creates a handler. Writes made by resolutions are broadcast through
    /// `gateway`.
    pub fn new(engine: Arc<SyncEngine>, gateway: Arc<BroadcastGateway>, config: &ServerConfig) -> Self {
        Self {
            engine,
            gateway,
            max_upload_changes: config.max_upload_changes,
        }
    }

    /// Handles a request. Failures become [`SyncResponse::Error`].
    pub fn handle(&self, request: SyncRequest) -> SyncResponse {
        let code = request.type_code();
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                if e.is_server_error() {
                    error!(request_type = code, error = %e, "request failed");
                } else {
                    debug!(request_type = code, error = %e, "request rejected");
                }
                SyncResponse::Error(e.to_response())
            }
        }
    }

    /// Handles a request, keeping the error typed.
    pub fn dispatch(&self, request: SyncRequest) -> ServerResult<SyncResponse> {
        let engine = &self.engine;
        let response = match request {
            SyncRequest::Upload(upload) => {
                self.check_upload_size(upload.changes.len())?;
                SyncResponse::Upload(engine.upload(upload)?)
            }
            SyncRequest::Download(download) => SyncResponse::Download(engine.download(&download)?),
            SyncRequest::Bidirectional(exchange) => {
                self.check_upload_size(exchange.changes.len())?;
                SyncResponse::Bidirectional(engine.bidirectional(exchange)?)
            }
            SyncRequest::ResolveConflict(resolve) => self.resolve(resolve)?,
            SyncRequest::Retry(batch) => {
                engine.batches().prepare_retry(&batch.batch_id)?;
                let dispatched = engine.worker().dispatch(&batch.batch_id)?;
                info!(
                    batch_id = %batch.batch_id,
                    attempt = dispatched.retry_count,
                    "retry dispatched"
                );
                SyncResponse::Batch(SyncResult::from_batch(&dispatched))
            }
            SyncRequest::BatchStatus(batch) => {
                SyncResponse::Batch(engine.batch_status(&batch.batch_id)?)
            }
            SyncRequest::Stats(filter) => SyncResponse::Stats(engine.batches().get_stats(&filter)?),
            SyncRequest::CreateSession(create) => {
                SyncResponse::Session(engine.sessions().create_session(NewSession::from(create))?)
            }
            SyncRequest::ValidateSession(session) => SyncResponse::SessionValid {
                valid: engine.sessions().validate_session(&session.session_id)?,
                session_id: session.session_id,
            },
            SyncRequest::UpdateActivity(session) => {
                match engine.sessions().update_activity(&session.session_id)? {
                    Some(updated) => SyncResponse::Session(updated),
                    None => return Err(SyncError::not_found("session", session.session_id).into()),
                }
            }
            SyncRequest::FetchPackage(package) => SyncResponse::Package(
                engine
                    .sessions()
                    .create_data_package(&package.session_id, package.entities.as_deref())?,
            ),
            SyncRequest::SaveOfflineChanges(save) => SyncResponse::SavedChanges(
                engine
                    .sessions()
                    .save_offline_changes(&save.session_id, save.changes)?,
            ),
            SyncRequest::EndSession(session) => {
                if !engine.sessions().end_session(&session.session_id)? {
                    return Err(SyncError::not_found("session", session.session_id).into());
                }
                SyncResponse::Ack
            }
            SyncRequest::CheckIn(session) => SyncResponse::CheckIn(engine.check_in(&session.session_id)?),
            SyncRequest::DeviceSessions(device) => {
                SyncResponse::Sessions(engine.sessions().get_device_sessions(&device.device_id)?)
            }
        };
        Ok(response)
    }

    /// Resolves a conflict, broadcasts the write and settles the batch once
    /// nothing is left open.
    fn resolve(&self, request: ResolveConflictRequest) -> ServerResult<SyncResponse> {
        let batches = self.engine.batches();
        let resolved = batches.resolve_conflict(
            &request.batch_id,
            &request.conflict_id,
            request.resolution,
            request.resolved_data,
        )?;
        if let Some(applied) = &resolved.applied {
            self.gateway.broadcast_applied(std::slice::from_ref(applied));
        }

        let before = batches.get_batch(&request.batch_id)?.status;
        let batch = batches.refresh_status(&request.batch_id)?;
        if before == BatchStatus::Conflicted && batch.status == BatchStatus::Completed {
            self.gateway.notify_device(
                &batch.device_id,
                &ServerMessage::BatchCompleted {
                    batch_id: batch.batch_id.clone(),
                    status: batch.status,
                },
            );
        }
        Ok(SyncResponse::Conflict(resolved.conflict))
    }

    fn check_upload_size(&self, changes: usize) -> ServerResult<()> {
        if changes > self.max_upload_changes {
            return Err(ServerError::InvalidRequest(format!(
                "Too many changes: {} > {}",
                changes, self.max_upload_changes
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("max_upload_changes", &self.max_upload_changes)
            .finish_non_exhaustive()
    }
}
