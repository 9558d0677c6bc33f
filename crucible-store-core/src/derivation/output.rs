// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

use crate::content_address::{ContentAddress, ContentAddressMethodAlgorithm};
use crate::derivation::{Derivation, OutputName};
use crate::store_path::{StoreDir, StorePath, StorePathNameError};

/// Descriptor for a single derivation output.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub enum DerivationOutput {
    /// Path precomputed from the derivation's inputs.
    InputAddressed(StorePath),
    /// Content address declared up front; the path follows from it.
    CAFixed(ContentAddress),
    /// Content-addressed, path unknown until built.
    CAFloating(ContentAddressMethodAlgorithm),
    /// No path yet.
    Deferred,
}

impl DerivationOutput {
    /// The output's store path, when one is determined before building.
    pub fn path(
        &self,
        store_dir: &StoreDir,
        drv: &Derivation,
        output_name: &OutputName,
    ) -> Result<Option<StorePath>, StorePathNameError> {
        match self {
            DerivationOutput::InputAddressed(store_path) => Ok(Some(store_path.clone())),
            DerivationOutput::CAFixed(ca) => {
                let name = drv.output_path_name(output_name)?;
                Ok(Some(store_dir.make_store_path_from_ca(&name, *ca)))
            }
            DerivationOutput::CAFloating(_) | DerivationOutput::Deferred => Ok(None),
        }
    }
}

#[cfg(test)]
mod unittests {
    use rstest::rstest;

    use super::*;
    use crate::derivation::test_data::hello_drv;

    #[test]
    fn floating_has_no_path() {
        let drv = hello_drv();
        let output = drv.outputs.get(&OutputName::default()).unwrap();
        assert_eq!(
            output
                .path(&StoreDir::default(), &drv, &OutputName::default())
                .unwrap(),
            None
        );
    }

    #[rstest]
    #[case::default_output("out", "hello")]
    #[case::named_output("dev", "hello-dev")]
    fn fixed_path_uses_output_qualified_name(#[case] output: &str, #[case] expected_name: &str) {
        let drv = hello_drv();
        let ca: ContentAddress =
            "fixed:r:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s"
                .parse()
                .unwrap();
        let output_name: OutputName = output.parse().unwrap();
        let path = DerivationOutput::CAFixed(ca)
            .path(&StoreDir::default(), &drv, &output_name)
            .unwrap()
            .unwrap();
        assert_eq!(path.name().as_str(), expected_name);
    }

    #[test]
    fn input_addressed_passthrough() {
        let drv = hello_drv();
        let path: StorePath = "00000000000000000000000000000000-fixed".parse().unwrap();
        let output = DerivationOutput::InputAddressed(path.clone());
        assert_eq!(
            output
                .path(&StoreDir::default(), &drv, &OutputName::default())
                .unwrap(),
            Some(path)
        );
    }
}
