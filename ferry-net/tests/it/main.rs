mod common;

mod linked;
mod listeners;
mod oos;
mod proxy;
mod quic;
mod tcp;
mod tls;
