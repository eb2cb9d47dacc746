mod client;

pub use client::JobManagerClient;
