// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
mod topology;

pub mod config;
pub mod connection;
pub mod context;
pub mod errors;
pub mod handler;
pub mod management;
pub mod pool;
pub mod publisher;
pub mod registry;
pub mod worker;
