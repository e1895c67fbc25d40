use std::path::PathBuf;
use thiserror::Error;

/// Errors generated by the session library.
#[derive(Debug, Error)]
pub enum Error {
    /// Error generated when a message fails verification or
    /// otherwise violates the protocol.
    ///
    /// Recovered locally: the message is discarded and, when it
    /// came from the session's authority, the state machine
    /// restarts.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Error generated when the outbound data queue is at
    /// capacity; the caller should retry after a round drains it.
    #[error("outbound queue is full")]
    QueueFull,

    /// Error generated when no factory is registered for a round
    /// type.
    #[error(r#"unknown round type "{0}""#)]
    UnknownRoundType(String),

    /// Error generated when a configured participant has no key
    /// share entry. Fatal at session construction.
    #[error(r#"participant "{0}" has no key share entry"#)]
    MissingParticipant(String),

    /// Error generated when a round operation is attempted with
    /// no active round.
    #[error("no active round")]
    NoActiveRound,

    /// Error generated by configuration validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error generated when a configuration path is not a file.
    #[error("path {0} is not a file")]
    NotFile(PathBuf),

    /// Error generated by the overlay transport.
    #[error("overlay: {0}")]
    Overlay(String),

    /// Error generated by the protocol library.
    #[error(transparent)]
    Codec(#[from] veil_protocol::Error),

    /// Error generated parsing TOML.
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Input/output error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is a protocol violation that the state
    /// machine recovers from locally.
    pub fn is_violation(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Codec(_))
    }
}
