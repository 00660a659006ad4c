// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared leaf types for the ORR signing control plane: the supported
//! software table and the canonical JSON encoding used for idempotence
//! checks.

pub mod json;
pub mod version;
