// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Test-only helpers for standing up one or more in-process [`crate::hub::MessagingService`]
//! instances bound to ephemeral loopback ports.

pub mod test_node;

pub use test_node::TestNode;
