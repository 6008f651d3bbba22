//! Test case management label keys and the run-level guard shared by the
//! TestRail, Xray and Zephyr integrations.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestRailKey {
    SyncEnabled,
    SyncRealTime,
    IncludeAllCases,
    SuiteId,
    RunId,
    RunName,
    Milestone,
    Assignee,
    CaseId,
}

impl TestRailKey {
    pub fn label_key(self) -> &'static str {
        match self {
            Self::SyncEnabled => "com.zebrunner.app/tcm.testrail.sync.enabled",
            Self::SyncRealTime => "com.zebrunner.app/tcm.testrail.sync.real-time",
            Self::IncludeAllCases => "com.zebrunner.app/tcm.testrail.include-all-cases",
            Self::SuiteId => "com.zebrunner.app/tcm.testrail.suite-id",
            Self::RunId => "com.zebrunner.app/tcm.testrail.run-id",
            Self::RunName => "com.zebrunner.app/tcm.testrail.run-name",
            Self::Milestone => "com.zebrunner.app/tcm.testrail.milestone",
            Self::Assignee => "com.zebrunner.app/tcm.testrail.assignee",
            Self::CaseId => "com.zebrunner.app/tcm.testrail.case-id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrayKey {
    SyncEnabled,
    SyncRealTime,
    ExecutionKey,
    TestKey,
}

impl XrayKey {
    pub fn label_key(self) -> &'static str {
        match self {
            Self::SyncEnabled => "com.zebrunner.app/tcm.xray.sync.enabled",
            Self::SyncRealTime => "com.zebrunner.app/tcm.xray.sync.real-time",
            Self::ExecutionKey => "com.zebrunner.app/tcm.xray.test-execution-key",
            Self::TestKey => "com.zebrunner.app/tcm.xray.test-key",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZephyrKey {
    SyncEnabled,
    SyncRealTime,
    TestCycleKey,
    JiraProjectKey,
    TestCaseKey,
}

impl ZephyrKey {
    pub fn label_key(self) -> &'static str {
        match self {
            Self::SyncEnabled => "com.zebrunner.app/tcm.zephyr.sync.enabled",
            Self::SyncRealTime => "com.zebrunner.app/tcm.zephyr.sync.real-time",
            Self::TestCycleKey => "com.zebrunner.app/tcm.zephyr.test-cycle-key",
            Self::JiraProjectKey => "com.zebrunner.app/tcm.zephyr.jira-project-key",
            Self::TestCaseKey => "com.zebrunner.app/tcm.zephyr.test-case-key",
        }
    }
}

/// How a TCM label is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcmScope {
    /// Configures the run; rejected once a test has started.
    Run,
    /// Identifies a case; attached to the current test, or the run when no
    /// test is active.
    Case,
}

pub trait TcmKey: Copy {
    fn label_key(self) -> &'static str;
    fn scope(self) -> TcmScope;
}

impl TcmKey for TestRailKey {
    fn label_key(self) -> &'static str {
        TestRailKey::label_key(self)
    }

    fn scope(self) -> TcmScope {
        match self {
            Self::CaseId => TcmScope::Case,
            _ => TcmScope::Run,
        }
    }
}

impl TcmKey for XrayKey {
    fn label_key(self) -> &'static str {
        XrayKey::label_key(self)
    }

    fn scope(self) -> TcmScope {
        match self {
            Self::TestKey => TcmScope::Case,
            _ => TcmScope::Run,
        }
    }
}

impl TcmKey for ZephyrKey {
    fn label_key(self) -> &'static str {
        ZephyrKey::label_key(self)
    }

    fn scope(self) -> TcmScope {
        match self {
            Self::TestCaseKey => TcmScope::Case,
            _ => TcmScope::Run,
        }
    }
}
