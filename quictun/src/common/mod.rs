// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod addr;
pub mod cipher;
pub mod config;
pub mod connection;
pub mod error;
pub mod packet_conn;
pub mod session;
pub mod tls;
pub mod transport;
