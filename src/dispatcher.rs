//! Single-reader task: owns the decoded envelope stream and routes each
//! envelope to the RPC core or Channel core.

use std::sync::Arc;

use crate::codec::{self, CHSIG_CLOSE, CHSIG_JOIN_ACK, Envelope};
use crate::connection::{BoxedReader, ConnectionInner};
use crate::error::Error;
use crate::framer::{self, FrameEvent};
use crate::rpc::RpcOutcome;

/// Runs the Framer+Dispatcher loop until end-of-stream or a protocol fault.
pub(crate) async fn run(inner: Arc<ConnectionInner>, mut reader: BoxedReader) {
    loop {
        let event = framer::read_payload(&mut reader, &inner.writer, &inner.ack_gate).await;
        match event {
            Ok(FrameEvent::Eof) => {
                log::debug!("connection {}: peer closed gracefully", inner.id);
                let _ = inner.graceful_close().await;
                break;
            }
            Err(fault) => {
                log::warn!("connection {}: framing fault: {fault}", inner.id);
                inner.terminate(fault).await;
                break;
            }
            Ok(FrameEvent::Payload(bytes)) => match codec::decode(&bytes) {
                Ok(envelope) => {
                    if let Err(fault) = handle_envelope(&inner, envelope).await {
                        log::error!("connection {}: protocol fault: {fault}", inner.id);
                        inner.terminate(fault).await;
                        break;
                    }
                }
                Err(fault) => {
                    log::warn!("connection {}: envelope decode fault: {fault}", inner.id);
                    inner.terminate(fault).await;
                    break;
                }
            },
        }
    }
}

async fn handle_envelope(
    inner: &Arc<ConnectionInner>,
    envelope: Envelope,
) -> Result<(), Error> {
    match envelope {
        Envelope::RpcRequest { id, name, parameters, return_dtypes } => {
            spawn_handler(Arc::clone(inner), id, name, parameters, return_dtypes.len());
            Ok(())
        }
        Envelope::RpcResponse { id, error, r#return } => {
            let outcome = match error {
                Some(message) if !message.is_empty() => RpcOutcome::Error(message),
                _ => RpcOutcome::Success(r#return.unwrap_or_default()),
            };
            inner.rpc.complete_call(&id, outcome).await
        }
        Envelope::ChannelRequest { id, cid } => {
            let delivered = inner.channels.deliver_join_request(&cid, id.clone()).await;
            if !delivered {
                inner
                    .send_envelope(Envelope::ChannelRequestResponse {
                        rqid: id,
                        cid: String::new(),
                        nabr: Some("#unknown_channel".to_string()),
                    })
                    .await
            } else {
                Ok(())
            }
        }
        Envelope::ChannelRequestResponse { rqid, cid, nabr } => {
            inner
                .channels
                .complete_join(
                    &rqid,
                    crate::channel::PendingJoinOutcome { channel_id: cid, not_accepted_reason: nabr },
                )
                .await
        }
        Envelope::ChannelSessionTransport { csid, pid, body } => {
            match inner.channels.get_session(&csid).await {
                Some(session) => {
                    let _ = session.incoming_tx.send((body.into_vec().into(), pid));
                    Ok(())
                }
                None => {
                    inner
                        .send_envelope(Envelope::ChannelSessionSignal { csid, pid: CHSIG_CLOSE })
                        .await
                }
            }
        }
        Envelope::ChannelTransportStateResponse { csid, pid, state: _ } => {
            match inner.channels.get_session(&csid).await {
                Some(session) => {
                    session.deliver_ack(pid).await;
                    Ok(())
                }
                None => Err(Error::ProtocolFault(format!("chtsr for unknown session {csid}"))),
            }
        }
        Envelope::ChannelSessionSignal { csid, pid } => match pid {
            CHSIG_CLOSE => {
                if let Some(session) = inner.channels.remove_session(&csid).await {
                    session.shutdown().await;
                }
                Ok(())
            }
            CHSIG_JOIN_ACK => match inner.channels.get_session(&csid).await {
                Some(session) => {
                    session.deliver_ack(0).await;
                    Ok(())
                }
                None => Err(Error::ProtocolFault(format!("join-ack for unknown session {csid}"))),
            },
            other => Err(Error::ProtocolFault(format!("unknown chsig value {other}"))),
        },
    }
}

fn spawn_handler(
    inner: Arc<ConnectionInner>,
    id: String,
    name: String,
    parameters: Vec<crate::codec::RpcDataCapsule>,
    expected_arity: usize,
) {
    tokio::spawn(async move {
        let handler = inner.rpc.lookup(&name).await;
        let response = match handler {
            None => Envelope::RpcResponse {
                id: id.clone(),
                error: Some("unknown rpc function called".to_string()),
                r#return: None,
            },
            Some(handler) => {
                if parameters.len() != handler.param_types().len() {
                    Envelope::RpcResponse {
                        id: id.clone(),
                        error: Some(format!(
                            "invalid argument: expected {} parameters, got {}",
                            handler.param_types().len(),
                            parameters.len()
                        )),
                        r#return: None,
                    }
                } else {
                    let req = crate::connection::Connection { inner: Arc::clone(&inner) }.request_handle();
                    let join = tokio::spawn(async move { handler.call(req, parameters).await });
                    match join.await {
                        Ok(Ok(returns)) if returns.len() == expected_arity || expected_arity == 0 => {
                            Envelope::RpcResponse { id: id.clone(), error: None, r#return: Some(returns) }
                        }
                        Ok(Ok(returns)) => Envelope::RpcResponse {
                            id: id.clone(),
                            error: Some(format!(
                                "handler returned {} values, caller expected {}",
                                returns.len(),
                                expected_arity
                            )),
                            r#return: None,
                        },
                        Ok(Err(message)) => {
                            Envelope::RpcResponse { id: id.clone(), error: Some(message), r#return: None }
                        }
                        Err(join_error) => {
                            let message = if join_error.is_panic() {
                                "handler panicked".to_string()
                            } else {
                                join_error.to_string()
                            };
                            Envelope::RpcResponse { id: id.clone(), error: Some(message), r#return: None }
                        }
                    }
                }
            }
        };
        if let Err(e) = inner.send_envelope(response).await {
            log::warn!("connection {}: failed to send rpc response for {id}: {e}", inner.id);
        }
    });
}
