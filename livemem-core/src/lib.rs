// Copyright 2025 Livemem (https://github.com/livemem)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Core data model for the Live Memory service.
//!
//! Everything that is serialized to the object store lives here: space
//! metadata, live-note keys and front-matter, token records, bank files and
//! backup descriptors, plus the validation rules shared by every entry
//! point. This crate performs no I/O.

pub mod backup;
pub mod bank;
pub mod keys;
pub mod note;
pub mod space;
pub mod token;
pub mod validate;

pub use backup::{parse_backup_id, BackupMeta};
pub use bank::{BankAction, BankFileUpdate, ConsolidationReply};
pub use keys::*;
pub use note::{LiveNote, NoteCategory, NoteKey};
pub use space::{GraphTarget, SpaceMeta};
pub use token::{Permission, TokenFile, TokenRecord};
pub use validate::ValidationError;
