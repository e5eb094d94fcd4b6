//! JUnit XML report generation.
//!
//! Every pool becomes one `<testsuite>`, so the same test run on two pools
//! appears twice, once under each pool's name:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="nightly" tests="2" failures="1" errors="0" time="1.234">
//!   <testsuite name="tablets" tests="2" failures="1" errors="0" skipped="0" time="1.234">
//!     <testcase classname="com.example.LoginTest" name="testValid" time="0.100">
//!       <properties><property name="device" value="emulator-5554"/></properties>
//!     </testcase>
//!     <testcase classname="com.example.LoginTest" name="testBroken" time="0.150">
//!       <properties><property name="device" value="emulator-5556"/></properties>
//!       <failure message="expected:&lt;true&gt;" type="FAIL">expected:&lt;true&gt; ...</failure>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! # Example
//!
//! ```
//! use poolrun::report::JUnitReporter;
//!
//! let reporter = JUnitReporter::new("build/test-results/junit.xml")
//!     .with_name("nightly");
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::Reporter;
use crate::orchestrator::{PoolPlan, PoolResult, RunResult};
use crate::testcase::{TestResult, TestStatus};

/// Reporter that writes a JUnit XML file when the run completes.
///
/// Parent directories are created automatically.
pub struct JUnitReporter {
    output_path: PathBuf,
    name: String,
}

impl JUnitReporter {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            name: "poolrun".to_string(),
        }
    }

    /// Sets the `name` of the `<testsuites>` root element.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Generate JUnit XML content from results.
    pub fn generate_xml(&self, run_result: &RunResult) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("name", self.name.as_str()));
        testsuites.push_attribute(("tests", run_result.total().to_string().as_str()));
        testsuites.push_attribute(("failures", run_result.failed().to_string().as_str()));
        testsuites.push_attribute(("errors", run_result.errors().to_string().as_str()));
        testsuites.push_attribute((
            "time",
            format!("{:.3}", run_result.duration.as_secs_f64()).as_str(),
        ));
        writer.write_event(Event::Start(testsuites))?;

        for pool in &run_result.pools {
            write_testsuite(&mut writer, pool)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;
        Ok(String::from_utf8(writer.into_inner())?)
    }

    async fn write(&self, run_result: &RunResult) -> anyhow::Result<()> {
        let xml = self.generate_xml(run_result)?;
        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.output_path, xml).await?;
        Ok(())
    }
}

fn write_testsuite<W: std::io::Write>(writer: &mut Writer<W>, pool: &PoolResult) -> anyhow::Result<()> {
    let time: f64 = pool.results.iter().map(|r| r.duration().as_secs_f64()).sum();
    let skipped = pool.count(TestStatus::Ignored) + pool.count(TestStatus::AssumptionFailed);

    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", pool.pool.as_str()));
    testsuite.push_attribute(("tests", pool.results.len().to_string().as_str()));
    testsuite.push_attribute(("failures", pool.count(TestStatus::Fail).to_string().as_str()));
    testsuite.push_attribute(("errors", pool.count(TestStatus::Error).to_string().as_str()));
    testsuite.push_attribute(("skipped", skipped.to_string().as_str()));
    testsuite.push_attribute(("time", format!("{:.3}", time).as_str()));
    writer.write_event(Event::Start(testsuite))?;

    for result in &pool.results {
        write_testcase(writer, result)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

fn write_testcase<W: std::io::Write>(writer: &mut Writer<W>, result: &TestResult) -> anyhow::Result<()> {
    let test = result.test();
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", test.qualified_class().as_str()));
    testcase.push_attribute(("name", test.method.as_str()));
    testcase.push_attribute((
        "time",
        format!("{:.3}", result.duration().as_secs_f64()).as_str(),
    ));
    writer.write_event(Event::Start(testcase))?;

    writer.write_event(Event::Start(BytesStart::new("properties")))?;
    let mut device = BytesStart::new("property");
    device.push_attribute(("name", "device"));
    device.push_attribute(("value", result.device().as_str()));
    writer.write_event(Event::Empty(device))?;
    writer.write_event(Event::End(BytesEnd::new("properties")))?;

    let trace = result.trace().map(clean_xml);
    match result.status() {
        TestStatus::Fail | TestStatus::Error | TestStatus::Unknown => {
            let element = if result.status() == TestStatus::Fail {
                "failure"
            } else {
                "error"
            };
            let mut failure = BytesStart::new(element);
            if let Some(message) = trace.as_deref().and_then(|t| t.lines().next()) {
                failure.push_attribute(("message", message));
            }
            failure.push_attribute(("type", result.status().as_str()));
            writer.write_event(Event::Start(failure))?;
            if let Some(trace) = &trace {
                writer.write_event(Event::Text(BytesText::new(trace)))?;
            }
            writer.write_event(Event::End(BytesEnd::new(element)))?;
        }
        TestStatus::Ignored | TestStatus::AssumptionFailed => {
            writer.write_event(Event::Empty(BytesStart::new("skipped")))?;
        }
        TestStatus::Pass => {}
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Drops characters XML 1.0 cannot represent. Escaping is left to the
/// writer.
fn clean_xml(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_run_start(&self, _pools: &[PoolPlan]) {}

    async fn on_test_complete(&self, _result: &TestResult) {}

    async fn on_run_complete(&self, result: &RunResult) {
        match self.write(result).await {
            Ok(()) => tracing::info!("JUnit XML written to: {}", self.output_path.display()),
            Err(e) => tracing::error!("Failed to write JUnit XML: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use crate::testcase::TestCase;
    use std::time::Duration;

    fn pool(name: &str, statuses: &[(&str, TestStatus)]) -> PoolResult {
        PoolResult {
            pool: name.into(),
            results: statuses
                .iter()
                .map(|(method, status)| {
                    let result = TestResult::new(
                        name.into(),
                        DeviceId::new("emulator-5554"),
                        TestCase::new("com.example", "LoginTest", *method),
                        *status,
                    );
                    if status.is_failure() {
                        result.with_trace("expected:<true> but was:<false>\n\tat LoginTest.kt:12")
                    } else {
                        result
                    }
                })
                .collect(),
            retried_attempts: vec![],
            unreachable: 0,
            devices: vec![],
        }
    }

    fn run(pools: Vec<PoolResult>) -> RunResult {
        RunResult {
            run_id: uuid::Uuid::nil(),
            pools,
            duration: Duration::from_millis(1234),
            ignore_failures: false,
            retries_used: 0,
        }
    }

    #[test]
    fn test_one_testsuite_per_pool() {
        let result = run(vec![
            pool("phones", &[("testValid", TestStatus::Pass), ("testBroken", TestStatus::Fail)]),
            pool("tablets", &[("testValid", TestStatus::Pass), ("testSkipped", TestStatus::Ignored)]),
        ]);

        let xml = JUnitReporter::new("unused.xml").generate_xml(&result).unwrap();
        assert_eq!(xml.matches("<testsuite ").count(), 2);
        assert!(xml.contains(r#"<testsuite name="phones" tests="2" failures="1" errors="0" skipped="0""#));
        assert!(xml.contains(r#"<testsuite name="tablets" tests="2" failures="0" errors="0" skipped="1""#));
        assert!(xml.contains(r#"<testsuites name="poolrun" tests="4" failures="1" errors="0" time="1.234">"#));
        assert!(xml.contains(r#"classname="com.example.LoginTest" name="testBroken""#));
        assert!(xml.contains(r#"<property name="device" value="emulator-5554"/>"#));
    }

    #[test]
    fn test_failure_text_is_escaped_once() {
        let result = run(vec![pool("p", &[("testBroken", TestStatus::Error)])]);
        let xml = JUnitReporter::new("unused.xml").generate_xml(&result).unwrap();
        assert!(xml.contains(r#"<error message="expected:&lt;true&gt; but was:&lt;false&gt;" type="ERROR">"#));
        assert!(!xml.contains("&amp;lt;"));
    }

    #[test]
    fn test_clean_xml_drops_control_characters() {
        assert_eq!(clean_xml("a\u{0}b\tc"), "ab\tc");
    }

    #[tokio::test]
    async fn test_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("junit.xml");
        JUnitReporter::new(&path)
            .on_run_complete(&run(vec![pool("p", &[("testValid", TestStatus::Pass)])]))
            .await;
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("<?xml"));
    }
}
