mod bootstrap;
mod cleanup;
mod consumer;
mod registry;
mod retry;
mod status;
