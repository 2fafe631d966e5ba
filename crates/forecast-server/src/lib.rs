//! HTTP service for next-hour PM2.5 forecasts

pub mod api;
pub mod config;
