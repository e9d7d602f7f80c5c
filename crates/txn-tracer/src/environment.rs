// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Package metadata reported alongside the application environment.

use crate::errors::ProviderError;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Package {
    pub name: String,
    pub version: String,
}

/// A collaborator that knows which packages the application depends on.
pub trait PackageProvider {
    fn packages(&self) -> Result<Vec<Package>, ProviderError>;
}

/// Asks `provider` for packages. A failing or panicking provider yields an
/// empty list.
pub fn collect_packages(provider: &dyn PackageProvider) -> Vec<Package> {
    let result = catch_unwind(AssertUnwindSafe(|| provider.packages()))
        .unwrap_or(Err(ProviderError::Panicked));
    match result {
        Ok(packages) => packages,
        Err(err) => {
            warn!("package collection skipped: {err}");
            Vec::new()
        }
    }
}
