//! QBMan queue manager access: the cache-line codec, frame/enqueue/pull descriptors and the
//! software portal protocol.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
pub mod codec;
pub mod descriptor;
pub mod portal;

pub use descriptor::{DqrrEntry, EnqueueDescriptor, FrameAnnotationStatus, FrameDescriptor, PullDescriptor};
pub use portal::{CommandState, QbmanPortal, MAX_BUFFERS_PER_COMMAND, QBMAN_POLL_BUDGET_US, QBMAN_POLL_INTERVAL_US};
