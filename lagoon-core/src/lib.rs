// Copyright 2025 Lagoon Contributors (https://github.com/lagoondb/lagoon)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Lagoon Core
//!
//! Wire value model, serializer, cache-key canonicalization, and the shared
//! error taxonomy for the Lagoon client data layer.

pub mod error;
pub mod key;
pub mod value;
pub mod wire;

pub use error::{LagoonError, Result};
pub use key::CacheKey;
pub use value::Value;
pub use wire::{deserialize, serialize};
