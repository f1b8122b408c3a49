// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Dependency resolution.

Applications declare package and application dependencies, and
implicitly depend on their base runtime application. The resolver
computes the transitive closure of those declarations. Dependencies
form a DAG over locators; a cycle means the catalog is corrupt and is
reported as an internal error.
*/

use {
    crate::{
        error::{ClusterPackagingError, Result},
        locator::Locator,
        store::{get_application, PackageStore},
    },
    std::{
        collections::{BTreeMap, BTreeSet},
        future::Future,
        pin::Pin,
    },
};

/// The transitive dependencies of an application.
///
/// Applications are ordered dependencies-first; the application the
/// closure was computed for is not included.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DependencySet {
    pub packages: Vec<Locator>,
    pub apps: Vec<Locator>,
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum VisitState {
    Visiting,
    Done,
}

struct Walk<'a> {
    store: &'a dyn PackageStore,
    state: BTreeMap<String, VisitState>,
    seen_packages: BTreeSet<String>,
    result: DependencySet,
}

impl<'a> Walk<'a> {
    fn visit(
        &mut self,
        locator: Locator,
        include_self: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            match self.state.get(&locator.to_string()) {
                Some(VisitState::Done) => return Ok(()),
                Some(VisitState::Visiting) => {
                    return Err(ClusterPackagingError::DependencyCycle(locator))
                }
                None => {}
            }

            self.state
                .insert(locator.to_string(), VisitState::Visiting);

            let application = get_application(self.store, &locator).await?;

            for package in application.manifest.package_dependencies()? {
                if self.seen_packages.insert(package.to_string()) {
                    self.result.packages.push(package);
                }
            }

            let mut dependency_apps = application.manifest.app_dependencies()?;

            if let Some(runtime) = application.manifest.runtime_locator()? {
                if !runtime.same_package(&locator) {
                    dependency_apps.push(runtime);
                }
            }

            for app in dependency_apps {
                self.visit(app, true).await?;
            }

            self.state.insert(locator.to_string(), VisitState::Done);

            if include_self {
                self.result.apps.push(locator);
            }

            Ok(())
        })
    }
}

/// Compute the transitive dependency closure of an application.
pub async fn get_dependencies(
    store: &dyn PackageStore,
    app: &Locator,
) -> Result<DependencySet> {
    let mut walk = Walk {
        store,
        state: BTreeMap::new(),
        seen_packages: BTreeSet::new(),
        result: DependencySet::default(),
    };

    walk.visit(app.clone(), false).await?;

    Ok(walk.result)
}

/// Whether a store holds the application and its entire closure.
pub async fn dependencies_satisfied(store: &dyn PackageStore, app: &Locator) -> Result<bool> {
    let dependencies = match get_dependencies(store, app).await {
        Ok(dependencies) => dependencies,
        Err(e) if e.is_not_found() => return Ok(false),
        Err(e) => return Err(e),
    };

    for locator in dependencies
        .packages
        .iter()
        .chain(dependencies.apps.iter())
    {
        match store.read_package_envelope(locator).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        }
    }

    Ok(true)
}
