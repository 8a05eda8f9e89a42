// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

pub mod config;
pub mod error;
pub mod etherscan;
pub mod fetcher;
pub mod merger;
pub mod output;
pub mod record;
pub mod source;
pub mod storage;
