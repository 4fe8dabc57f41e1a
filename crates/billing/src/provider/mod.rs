//! Payment-provider integration: wire types and the HTTP client.

pub mod client;
pub mod types;

pub use client::{HttpProviderClient, ProviderApi};
pub use types::{
    CheckoutMode, CheckoutSession, LineItem, ProviderCharge, ProviderEvent, ProviderInvoice,
    ProviderPaymentIntent, ProviderSubscription,
};
