//! Sangha: backend for a meditation institute's community site.
//!
//! Public JSON endpoints (contact form, newsletter, events, content,
//! resources, volunteer and teacher applications), an admin console API
//! guarded by a role/capability table, and an edge gatekeeper protecting
//! the `/admin` pages.

pub mod applications;
pub mod cache;
pub mod config;
pub mod contact;
pub mod content;
pub mod database;
pub mod error;
pub mod events;
pub mod gatekeeper;
pub mod health;
pub mod lifecycle;
pub mod mailer;
pub mod otp;
pub mod rbac;
pub mod resources;
pub mod session;
pub mod subscribers;
pub mod users;
pub mod validation;
pub mod web;
