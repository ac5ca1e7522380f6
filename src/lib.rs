//! Reglink: a hardware control-plane transport layer for register access
//! and acquisition-data streaming over heterogeneous physical links.
//!
//! Upper-layer device models issue register reads/writes and command
//! strobes through a transport-agnostic request/response API; this crate
//! owns the hard part underneath: correlating asynchronous, possibly-lost
//! traffic with outstanding requests, demultiplexing register replies from
//! bulk acquisition data on the same physical link, and fanning bulk data
//! out to live-monitoring consumers without ever blocking the producer.
//!
//! # Overview
//!
//! One [`Link`] owns a set of [`Destination`]s (the physical endpoints) and
//! three cooperating tasks:
//!
//! ```text
//!  CALLER                                            reglink
//! ┌───────────────┐  execute / execute_async  ┌─────────────────────┐
//! │ device model  │ ─────────────────────────▶│  TransactionEngine  │
//! └───────────────┘   (single-flight RPC)     │  Idle→Pending→Done  │
//!                                             └──────────┬──────────┘
//!                                                        │ outbound queue
//!                                                        ▼
//!                                             ┌─────────────────────┐
//!                          I/O task           │ transmit on routed  │
//!                                             │     Destination     │
//!                                             └──────────┬──────────┘
//!                                                        ▼  wire
//!                                             ┌─────────────────────┐
//!                          receive task       │ poll + classify:    │
//!                                             │ register reply ─────┼──▶ engine
//!                                             │ bulk data ──────────┼─┐
//!                                             └─────────────────────┘ │ inbound queue
//!                                                                     ▼ (drop on full)
//!                                             ┌─────────────────────┐
//!                          data task          │ fan out to sinks:   │
//!                                             │ shared ring, UDP    │
//!                                             │ forward, file,      │
//!                                             │ callback            │
//!                                             └─────────────────────┘
//! ```
//!
//! Four destination variants cover the supported media: [`MappedDest`]
//! (direct memory-mapped register space, synchronous), [`PacketDest`]
//! (fiber packet lanes with virtual channels), [`AxisDest`] (AXI-stream
//! character devices with sideband routing) and [`UdpDest`] (datagrams
//! with continuation framing). A link may hold several at once; the
//! [`Routing`] word selects the destination and per-class sub-channel of
//! every transaction.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use reglink::{Link, MappedDest, Register, Routing, Span, Transaction};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // A link over directly mapped register space.
//!     let link = Link::builder()
//!         .destination(Arc::new(MappedDest::anonymous([Span::new(0x0, 0x1000)])))
//!         .build();
//!     link.open().await?;
//!
//!     // Shadow register: mutate, write through, read back.
//!     let mut control = Register::new("control", 0x10, 1);
//!     control.set(0xDEAD_BEEF, 0, 0xFFFF_FFFF);
//!     link.execute(Transaction::write(&mut control, Routing::default())).await?;
//!     link.execute(Transaction::read(&mut control, Routing::default())).await?;
//!     assert_eq!(control.data()[0], 0xDEAD_BEEF);
//!     assert!(!control.stale());
//!
//!     link.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Delivery model
//!
//! Register and command transactions are strictly ordered and single-flight
//! per link: a caller blocked in [`Link::execute`] owns the wire until its
//! response arrives or times out. The data path makes the opposite trade:
//! records are delivered to sinks in receive order but are silently dropped
//! under queue or ring pressure, surfacing only in counters
//! ([`Link::stats`]). Live telemetry prefers loss to backpressure.
//!
//! The [`SharedRing`] sink is a named shared-memory segment any process can
//! attach to read-only ([`SharedRingReader`]); readers that fall behind the
//! writer resynchronize to its last-good snapshot, trading old records for
//! a consistent stream.

mod codec;
mod dest;
mod engine;
mod protocol;
mod pump;
mod queue;
mod register;
mod shm;
mod stats;
mod sync;

pub use codec::{CommandFrame, FrameError, RegisterReply, RegisterRequest};
pub use dest::{
    AxisDest, AxisMeta, AxisPort, Destination, MappedDest, PacketDest, PacketMeta, PacketPort,
    RxFrame, Span, TransportError, TxFrame, TxPayload, TxResult, UdpDest,
};
pub use engine::{LinkError, Transaction};
pub use protocol::{DataSourceSet, Routing, SourceKey, TxKind, Word};
pub use pump::{DataCallback, Link, LinkBuilder, LinkState};
pub use register::{Command, DataRecord, RecordKind, Register};
pub use shm::{RingRecord, SharedRing, SharedRingReader};
pub use stats::LinkStatsSnapshot;
