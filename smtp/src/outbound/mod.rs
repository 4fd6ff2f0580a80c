/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod client;
pub mod dane;
pub mod delivery;
pub mod error;
pub mod levels;
pub mod limits;
pub mod lookup;
pub mod mta_sts;
pub mod policy;
pub mod pool;
pub mod sts_preload;

pub use error::{DeliveryError, ErrorDetails, Status};
