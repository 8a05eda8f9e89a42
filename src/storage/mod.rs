// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage subsystem: chunk files + range index + atomic index persistence.

pub mod chunk_store;
pub mod index;
pub mod persistence;
