//! Line-delimited JSON protocol: one `Hello` frame, then request/reply
//! frames, with subscription notifications interleaved on the same
//! connection.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{info, warn};
use ulid::Ulid;

use crate::auth::{self, Hello};
use crate::engine::SlotFilter;
use crate::facade::{BookingFacade, BookingResult, Rejection, classify};
use crate::model::*;
use crate::observability;

const MAX_LINE_LEN: usize = 64 * 1024;

pub struct AppState {
    pub facade: BookingFacade,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    ListSlots {
        #[serde(default)]
        filter: SlotFilter,
    },
    Snapshot,
    Book {
        slot_id: Ulid,
    },
    Cancel {
        booking_id: Ulid,
    },
    MyBooking,
    CreateSlot {
        start: Ms,
        end: Ms,
        capacity: u32,
        location: Location,
    },
    CreateSlotSeries {
        start: Ms,
        end: Ms,
        interval_ms: Ms,
        capacity: u32,
        location: Location,
    },
    UpdateSlot {
        slot_id: Ulid,
        capacity: u32,
        location: Location,
    },
    SetSlotOpen {
        slot_id: Ulid,
        open: bool,
    },
    DeleteSlot {
        slot_id: Ulid,
    },
    SlotBookings {
        slot_id: Ulid,
    },
    Subscribe {
        slot_id: Ulid,
    },
}

impl Request {
    fn requires_admin(&self) -> bool {
        matches!(
            self,
            Request::CreateSlot { .. }
                | Request::CreateSlotSeries { .. }
                | Request::UpdateSlot { .. }
                | Request::SetSlotOpen { .. }
                | Request::DeleteSlot { .. }
                | Request::SlotBookings { .. }
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Hello { role: Role },
    Slots { slots: Vec<SlotInfo> },
    Snapshot { entries: Vec<AvailabilityEntry> },
    Booked { booking: BookingInfo },
    Cancelled { booking: BookingInfo },
    MyBooking { booking: Option<BookingInfo> },
    SlotCreated { slot_id: Ulid },
    SeriesCreated { slot_ids: Vec<Ulid>, skipped: usize },
    Bookings { bookings: Vec<BookingInfo> },
    Done,
    Subscribed { slot_id: Ulid },
    Notification { slot_id: Ulid, event: Event },
    Rejected { reason: Rejection },
    Unavailable,
    Error { message: String },
}

impl Reply {
    fn status_label(&self) -> &'static str {
        match self {
            Reply::Rejected { .. } => "rejected",
            Reply::Unavailable => "unavailable",
            Reply::Error { .. } => "error",
            _ => "ok",
        }
    }
}

fn result_reply(result: BookingResult, cancelled: bool) -> Reply {
    match result {
        BookingResult::Ok(booking) if cancelled => Reply::Cancelled { booking },
        BookingResult::Ok(booking) => Reply::Booked { booking },
        BookingResult::Rejected(reason) => Reply::Rejected { reason },
        BookingResult::Unavailable => Reply::Unavailable,
        BookingResult::Failed => Reply::Error { message: "internal error".into() },
    }
}

async fn handle_request(
    state: &AppState,
    actor: Actor,
    req: Request,
    ev_tx: &mpsc::Sender<Reply>,
) -> Reply {
    if req.requires_admin() && !actor.is_admin() {
        return Reply::Rejected { reason: Rejection::Forbidden };
    }
    let facade = &state.facade;
    match req {
        Request::ListSlots { filter } => Reply::Slots { slots: facade.list_slots(&filter).await },
        Request::Snapshot => Reply::Snapshot { entries: facade.availability_snapshot().await },
        Request::Book { slot_id } => {
            result_reply(facade.request_booking(actor.id, slot_id).await, false)
        }
        Request::Cancel { booking_id } => {
            result_reply(facade.request_cancellation(booking_id, actor).await, true)
        }
        Request::MyBooking => Reply::MyBooking { booking: facade.active_booking_for(actor.id).await },
        Request::CreateSlot { start, end, capacity, location } => {
            let slot_id = Ulid::new();
            match facade
                .engine()
                .create_slot(slot_id, Span { start, end }, capacity, location)
                .await
            {
                Ok(()) => Reply::SlotCreated { slot_id },
                Err(e) => result_reply(classify(e), false),
            }
        }
        Request::CreateSlotSeries { start, end, interval_ms, capacity, location } => {
            match facade
                .engine()
                .create_slot_series(Span { start, end }, interval_ms, capacity, location)
                .await
            {
                Ok((slot_ids, skipped)) => Reply::SeriesCreated { slot_ids, skipped },
                Err(e) => result_reply(classify(e), false),
            }
        }
        Request::UpdateSlot { slot_id, capacity, location } => {
            match facade.engine().update_slot(slot_id, capacity, location).await {
                Ok(()) => Reply::Done,
                Err(e) => result_reply(classify(e), false),
            }
        }
        Request::SetSlotOpen { slot_id, open } => {
            match facade.engine().set_slot_open(slot_id, open).await {
                Ok(()) => Reply::Done,
                Err(e) => result_reply(classify(e), false),
            }
        }
        Request::DeleteSlot { slot_id } => match facade.engine().delete_slot(slot_id).await {
            Ok(()) => Reply::Done,
            Err(e) => result_reply(classify(e), false),
        },
        Request::SlotBookings { slot_id } => {
            match facade.engine().bookings_for_slot(slot_id).await {
                Ok(bookings) => Reply::Bookings { bookings },
                Err(e) => result_reply(classify(e), false),
            }
        }
        Request::Subscribe { slot_id } => {
            let mut rx = facade.engine().notify.subscribe(slot_id);
            let tx = ev_tx.clone();
            tokio::spawn(async move {
                while let Ok(event) = rx.recv().await {
                    if tx.send(Reply::Notification { slot_id, event }).await.is_err() {
                        break; // connection gone
                    }
                }
            });
            Reply::Subscribed { slot_id }
        }
    }
}

fn codec_err(e: tokio_util::codec::LinesCodecError) -> io::Error {
    io::Error::other(e.to_string())
}

pub async fn process_connection(socket: TcpStream, state: Arc<AppState>) -> io::Result<()> {
    let framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (mut sink, mut stream) = framed.split();

    // Handshake: one hello frame, checked before anything else.
    let first = match stream.next().await {
        Some(Ok(line)) => line,
        Some(Err(e)) => return Err(codec_err(e)),
        None => return Ok(()),
    };
    let actor = match serde_json::from_str::<Hello>(&first)
        .map_err(|e| e.to_string())
        .and_then(|h| {
            auth::authenticate(&state.token, &h).map_err(|e| e.to_string())
        }) {
        Ok(actor) => actor,
        Err(message) => {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            let reply = serde_json::to_string(&Reply::Error { message })
                .map_err(io::Error::other)?;
            sink.send(reply).await.map_err(codec_err)?;
            return Ok(());
        }
    };
    let hello = serde_json::to_string(&Reply::Hello { role: actor.role })
        .map_err(io::Error::other)?;
    sink.send(hello).await.map_err(codec_err)?;

    // Subscription notifications fan into this queue and interleave with
    // replies on the same sink.
    let (ev_tx, mut ev_rx) = mpsc::channel::<Reply>(256);

    loop {
        tokio::select! {
            maybe = stream.next() => {
                let line = match maybe {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => return Err(codec_err(e)),
                    None => break,
                };
                let reply = match serde_json::from_str::<Request>(&line) {
                    Ok(req) => {
                        let label = observability::request_label(&req);
                        let start = Instant::now();
                        let reply = handle_request(&state, actor, req, &ev_tx).await;
                        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => label)
                            .record(start.elapsed().as_secs_f64());
                        metrics::counter!(
                            observability::REQUESTS_TOTAL,
                            "op" => label,
                            "status" => reply.status_label()
                        )
                        .increment(1);
                        reply
                    }
                    Err(e) => Reply::Error { message: format!("bad request: {e}") },
                };
                let json = serde_json::to_string(&reply).map_err(io::Error::other)?;
                sink.send(json).await.map_err(codec_err)?;
            }
            Some(ev) = ev_rx.recv() => {
                let json = serde_json::to_string(&ev).map_err(io::Error::other)?;
                sink.send(json).await.map_err(codec_err)?;
            }
        }
    }

    Ok(())
}

/// Accept loop with a connection-limit semaphore. Stops accepting when
/// `shutdown` resolves, then drains in-flight connections (up to 10s).
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    max_connections: usize,
    shutdown: impl std::future::Future<Output = ()>,
) -> io::Result<()> {
    let semaphore = Arc::new(Semaphore::new(max_connections));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let state = state.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = process_connection(socket, state).await {
                        warn!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    Ok(())
}
