//! Unit tests for configuration file edits and the reconfigure plan

use ops_operator::crd::{ConfigConstraintSpec, FileFormat, ParameterPair, annotations};
use ops_operator::handlers::reconfigure::diff::{ConfigDiff, ConfigFile};
use ops_operator::handlers::reconfigure::pipeline::{ReconfigureInput, plan};

const PROPERTIES: &str = "# broker settings\nlog.retention.hours=168\nnum.network.threads: 3\n";

mod properties_tests {
    use super::*;

    #[test]
    fn test_properties_accept_both_separators() {
        let file = ConfigFile::parse(FileFormat::Properties, PROPERTIES);
        assert_eq!(file.get("log.retention.hours"), Some("168"));
        assert_eq!(file.get("num.network.threads"), Some("3"));
    }

    #[test]
    fn test_removal_keeps_comments() {
        let mut file = ConfigFile::parse(FileFormat::Properties, PROPERTIES);
        file.set("num.network.threads", None);
        assert_eq!(file.render(), "# broker settings\nlog.retention.hours=168\n");
    }

    #[test]
    fn test_diff_classifies_changes() {
        let before = ConfigFile::parse(FileFormat::Properties, PROPERTIES);
        let mut after = before.clone();
        after.set("log.retention.hours", Some("72"));
        after.set("num.network.threads", None);
        after.set("auto.create.topics.enable", Some("false"));

        let diff = ConfigDiff::between(&before.parameters(), &after.parameters());
        assert_eq!(diff.updated.get("log.retention.hours").map(String::as_str), Some("72"));
        assert!(diff.deleted.contains("num.network.threads"));
        assert!(diff.added.contains_key("auto.create.topics.enable"));
        assert_eq!(diff.changed_keys().count(), 3);
    }
}

mod plan_tests {
    use super::*;

    fn input(params: Vec<ParameterPair>) -> ReconfigureInput {
        ReconfigureInput {
            ops_name: "tune-kafka".into(),
            component: "broker".into(),
            config_map: "kafka-broker-config".into(),
            file_name: "server.properties".into(),
            current: Some(PROPERTIES.into()),
            constraint: Some(ConfigConstraintSpec {
                file_format: FileFormat::Properties,
                dynamic_parameters: vec!["log.retention.hours".into()],
                ..Default::default()
            }),
            parameters: params,
        }
    }

    #[test]
    fn test_dynamic_update_needs_no_restart() {
        let plan = plan(input(vec![ParameterPair {
            key: "log.retention.hours".into(),
            value: Some("72".into()),
        }]))
        .unwrap();
        assert!(!plan.restart_required);
        assert_eq!(
            plan.annotations.get(annotations::LAST_APPLIED_OPS).map(String::as_str),
            Some("tune-kafka")
        );
        assert!(plan.content.unwrap().contains("log.retention.hours=72"));
    }

    #[test]
    fn test_removing_an_undeclared_key_needs_restart() {
        let plan = plan(input(vec![ParameterPair {
            key: "num.network.threads".into(),
            value: None,
        }]))
        .unwrap();
        assert!(plan.restart_required);
        assert!(!plan.content.unwrap().contains("num.network.threads"));
    }

    #[test]
    fn test_missing_constraint_is_fatal() {
        let mut i = input(vec![ParameterPair {
            key: "log.retention.hours".into(),
            value: Some("1".into()),
        }]);
        i.constraint = None;
        assert!(plan(i).unwrap_err().is_fatal());
    }
}
