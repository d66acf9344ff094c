//! End-to-end tests against real toolchains.
//!
//! Each test skips itself when the toolchain it needs is not installed, so
//! the suite stays green on minimal CI images.

use execbox::adapters::languages::{cpp, java, javascript};
use execbox::adapters::LanguageAdapter;
use execbox::core::supervisor::Supervisor;
use execbox::safety::workspace::WorkspaceManager;
use execbox::utils::output::truncation_marker;
use execbox::{
    CancelToken, DiagnosticCategory, Engine, EngineConfig, ErrorKind, ExecutionRequest,
    ExecutionStatus, Language, LimitOverrides, PolicyRegistry, StageKind,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn have(tool: &str) -> bool {
    let found = which::which(tool).is_ok();
    if !found {
        eprintln!("skipping: {} not installed", tool);
    }
    found
}

fn engine() -> (Engine, TempDir) {
    let root = TempDir::new().unwrap();
    let config = EngineConfig {
        workspace_root: root.path().join("workspaces"),
        ..EngineConfig::default()
    };
    (Engine::new(config).unwrap(), root)
}

fn timeout_ms(millis: u64) -> LimitOverrides {
    LimitOverrides {
        timeout_millis: Some(millis),
        ..LimitOverrides::default()
    }
}

fn memory_mb(mb: u64) -> LimitOverrides {
    LimitOverrides {
        memory_limit_bytes: Some(mb * 1024 * 1024),
        ..LimitOverrides::default()
    }
}

fn assert_capability_denied(result: &execbox::ExecutionResult) {
    assert_eq!(result.status(), ExecutionStatus::Error, "{:?}", result);
    assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeError), "{:?}", result);
    let diagnostic = result.diagnostic().unwrap();
    assert_eq!(diagnostic.category, DiagnosticCategory::CapabilityDenied, "{:?}", result);
}

fn leftover_workspaces(engine: &Engine) -> usize {
    std::fs::read_dir(engine.workspaces().root())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .count()
}

const HELLO: [(Language, &str, &str); 4] = [
    (Language::Python, "python3", "print('hello from execbox')"),
    (
        Language::JavaScript,
        "node",
        "console.log('hello from execbox');",
    ),
    (
        Language::Java,
        "javac",
        "public class Main {\n    public static void main(String[] args) {\n        System.out.println(\"hello from execbox\");\n    }\n}\n",
    ),
    (
        Language::Cpp,
        "g++",
        "#include <iostream>\nint main() {\n    std::cout << \"hello from execbox\" << std::endl;\n    return 0;\n}\n",
    ),
];

#[test]
fn test_hello_world_every_language() {
    let (engine, _root) = engine();

    for (language, tool, code) in HELLO {
        if !have(tool) {
            continue;
        }
        let result = engine.execute(ExecutionRequest::new(code, language));
        assert_eq!(
            result.status(),
            ExecutionStatus::Completed,
            "{}: {:?}",
            language,
            result
        );
        assert_eq!(result.error_kind(), None);
        assert_eq!(result.stdout().trim_end(), "hello from execbox");
        assert_eq!(result.stderr(), "", "{}", language);
        assert_eq!(result.exit_code(), Some(0));
        assert!(result.ran_stage(StageKind::Run));
    }

    assert_eq!(engine.workspaces().active_count(), 0);
    assert_eq!(leftover_workspaces(&engine), 0);
}

#[test]
fn test_infinite_loop_times_out_and_cleans_up() {
    let (engine, _root) = engine();
    let loops = [
        (Language::Python, "python3", "while True:\n    pass\n"),
        (Language::JavaScript, "node", "while (true) {}"),
        (
            Language::Java,
            "javac",
            "public class Main {\n    public static void main(String[] args) {\n        while (true) {}\n    }\n}\n",
        ),
        (
            Language::Cpp,
            "g++",
            "int main() {\n    volatile unsigned long n = 0;\n    while (true) { n++; }\n}\n",
        ),
    ];

    let timeout = 1_000;
    let bound = Duration::from_millis(timeout)
        + engine.config().kill_grace()
        + engine.config().output_drain_timeout()
        + Duration::from_millis(500);

    for (language, tool, code) in loops {
        if !have(tool) {
            continue;
        }
        let request = ExecutionRequest::new(code, language).with_limits(timeout_ms(timeout));
        let result = engine.execute(request);

        assert_eq!(result.status(), ExecutionStatus::Timeout, "{:?}", result);
        assert_eq!(result.error_kind(), Some(ErrorKind::TimeoutExceeded));
        let run = result
            .stages()
            .iter()
            .find(|stage| stage.kind == StageKind::Run)
            .unwrap();
        assert!(run.timed_out);
        assert!(
            Duration::from_millis(run.duration_millis) <= bound,
            "{} took {}ms",
            language,
            run.duration_millis
        );
    }

    assert_eq!(engine.workspaces().active_count(), 0);
    assert_eq!(leftover_workspaces(&engine), 0);
}

#[test]
fn test_python_process_spawn_is_denied() {
    if !have("python3") {
        return;
    }
    let (engine, _root) = engine();
    let attempts = [
        "import os\nos.system('echo escaped > /tmp/execbox-escape')\n",
        "import subprocess\nsubprocess.run(['echo', 'escaped'])\n",
    ];

    for code in attempts {
        let result = engine.execute(ExecutionRequest::new(code, Language::Python));
        assert_eq!(result.status(), ExecutionStatus::Error, "{:?}", result);
        assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeError));
        assert!(result.stderr().contains("capability denied"), "{}", result.stderr());
        assert!(!result.stdout().contains("escaped"));
        let diagnostic = result.diagnostic().unwrap();
        assert_eq!(diagnostic.category, DiagnosticCategory::CapabilityDenied);
    }
}

#[test]
fn test_python_network_import_denied_data_import_allowed() {
    if !have("python3") {
        return;
    }
    let (engine, _root) = engine();

    let denied = engine.execute(ExecutionRequest::new(
        "import socket\ns = socket.socket()\ns.connect(('127.0.0.1', 9))\n",
        Language::Python,
    ));
    assert_eq!(denied.status(), ExecutionStatus::Error);
    assert!(denied.stderr().contains("capability denied"), "{}", denied.stderr());

    let allowed = engine.execute(ExecutionRequest::new(
        "import json\nprint(json.dumps({'ok': True}))\n",
        Language::Python,
    ));
    assert_eq!(allowed.status(), ExecutionStatus::Completed, "{:?}", allowed);
    assert_eq!(allowed.stdout().trim_end(), "{\"ok\": true}");
}

#[test]
fn test_python_syntax_error_has_line() {
    if !have("python3") {
        return;
    }
    let (engine, _root) = engine();
    let result = engine.execute(ExecutionRequest::new(
        "x = 1\nprint(x\n",
        Language::Python,
    ));
    assert_eq!(result.status(), ExecutionStatus::Error);
    assert_eq!(result.error_kind(), Some(ErrorKind::SyntaxError));
    let diagnostic = result.diagnostic().unwrap();
    assert_eq!(diagnostic.category, DiagnosticCategory::Syntax);
    assert!(diagnostic.line.is_some());
}

#[test]
fn test_python_memory_exhaustion_is_resource_error() {
    if !have("python3") {
        return;
    }
    let (engine, _root) = engine();
    let request = ExecutionRequest::new("data = bytearray(8 * 1024 ** 3)\n", Language::Python)
        .with_limits(LimitOverrides {
            memory_limit_bytes: Some(256 * 1024 * 1024),
            ..LimitOverrides::default()
        });
    let result = engine.execute(request);
    assert_eq!(result.status(), ExecutionStatus::Error, "{:?}", result);
    assert_eq!(result.error_kind(), Some(ErrorKind::ResourceLimitExceeded));
}

#[test]
fn test_identical_code_runs_concurrently_in_separate_workspaces() {
    if !have("python3") {
        return;
    }
    let (engine, _root) = engine();
    let engine = Arc::new(engine);
    let code = "import os\nfor i in range(200):\n    print(i, os.getcwd())\n";

    let handles: Vec<_> = (0..2)
        .map(|_| engine.submit(ExecutionRequest::new(code, Language::Python)))
        .collect();
    let ids: Vec<String> = handles
        .iter()
        .map(|handle| handle.execution_id().to_string())
        .collect();
    assert_ne!(ids[0], ids[1]);

    let results: Vec<_> = handles.into_iter().map(|handle| handle.wait()).collect();
    let mut cwds = Vec::new();
    for result in &results {
        assert_eq!(result.status(), ExecutionStatus::Completed, "{:?}", result);
        let lines: Vec<&str> = result.stdout().lines().collect();
        assert_eq!(lines.len(), 200);
        let cwd = lines[0].split_once(' ').unwrap().1.to_string();
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(*line, format!("{} {}", i, cwd));
        }
        assert!(cwd.ends_with(result.execution_id()));
        cwds.push(cwd);
    }
    assert_ne!(cwds[0], cwds[1]);
    assert_eq!(leftover_workspaces(&engine), 0);
}

#[test]
fn test_compile_error_never_runs() {
    let (engine, _root) = engine();
    let broken = [
        (
            Language::Java,
            "javac",
            "public class Main {\n    public static void main(String[] args) {\n        System.out.println(\"missing\")\n    }\n}\n",
        ),
        (
            Language::Cpp,
            "g++",
            "#include <cstdio>\nint main() {\n    std::puts(\"missing\")\n}\n",
        ),
    ];

    for (language, tool, code) in broken {
        if !have(tool) {
            continue;
        }
        let result = engine.execute(ExecutionRequest::new(code, language));
        assert_eq!(result.status(), ExecutionStatus::Error, "{:?}", result);
        assert_eq!(result.error_kind(), Some(ErrorKind::CompileError));
        assert!(result.ran_stage(StageKind::Compile));
        assert!(!result.ran_stage(StageKind::Run));
        assert_eq!(result.stdout(), "");
        let diagnostic = result.diagnostic().unwrap();
        assert_eq!(diagnostic.category, DiagnosticCategory::Compile);
        assert!(diagnostic.line.is_some(), "{:?}", diagnostic);
    }
    assert_eq!(leftover_workspaces(&engine), 0);
}

#[test]
fn test_output_truncated_with_marker() {
    if !have("python3") {
        return;
    }
    let (engine, _root) = engine();
    let request = ExecutionRequest::new("print('x' * 10000, end='')\n", Language::Python)
        .with_limits(LimitOverrides {
            max_captured_output_bytes: Some(100),
            ..LimitOverrides::default()
        });
    let result = engine.execute(request);

    assert_eq!(result.status(), ExecutionStatus::Completed);
    assert!(result.stdout_truncated());
    let marker = truncation_marker(9_900);
    assert!(result.stdout().ends_with(&marker), "{}", result.stdout());
    assert_eq!(result.stdout().len(), 100 + marker.len());
    assert!(result.stdout().starts_with(&"x".repeat(100)));
}

#[test]
fn test_unsupported_language_allocates_nothing() {
    let (engine, _root) = engine();
    let result = engine.execute_source("PRINT 1", "cobol", None);

    assert_eq!(result.status(), ExecutionStatus::Rejected);
    assert_eq!(result.error_kind(), Some(ErrorKind::UnsupportedLanguage));
    assert!(result.stages().is_empty());
    assert_eq!(result.exit_code(), None);
    assert_eq!(leftover_workspaces(&engine), 0);
}

#[test]
fn test_cancel_submitted_execution() {
    if !have("python3") {
        return;
    }
    let (engine, _root) = engine();
    let engine = Arc::new(engine);
    let request = ExecutionRequest::new(
        "import time\nprint('started', flush=True)\nwhile True:\n    time.sleep(0.05)\n",
        Language::Python,
    )
    .with_limits(timeout_ms(20_000));

    let handle = engine.submit(request);
    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.status() != ExecutionStatus::Running && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    std::thread::sleep(Duration::from_millis(300));
    let cancelled_at = Instant::now();
    handle.cancel();

    let result = handle.wait();
    assert_eq!(result.status(), ExecutionStatus::Cancelled, "{:?}", result);
    assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
    assert!(cancelled_at.elapsed() < Duration::from_secs(5));
    assert_eq!(engine.in_flight(), 0);
    assert_eq!(leftover_workspaces(&engine), 0);
}

#[test]
fn test_python_guard_ignores_claimed_filenames() {
    if !have("python3") {
        return;
    }
    let (engine, _root) = engine();
    let attempts = [
        "exec(compile('import socket', '/usr/lib/x.py', 'exec'))\n",
        "exec(compile('import ctypes', '/usr/lib/python3/x.py', 'exec'))\n",
        "import json\nexec(compile('import socket', json.__file__, 'exec'), json.__dict__.copy())\n",
    ];

    for code in attempts {
        let result = engine.execute(ExecutionRequest::new(code, Language::Python));
        assert_capability_denied(&result);
        assert!(result.stderr().contains("capability denied"), "{}", result.stderr());
    }
}

#[test]
fn test_python_native_code_cannot_reach_libc() {
    if !have("python3") {
        return;
    }
    let (engine, root) = engine();
    let outside = root.path().join("escaped");
    // runpy imports the package from trusted code before failing on the
    // missing __main__, leaving ctypes in sys.modules
    let preamble = "import runpy, sys\ntry:\n    runpy.run_module('ctypes')\nexcept ImportError:\n    pass\nctypes = sys.modules['ctypes']\n";
    let attempts = [
        format!("{}ctypes.CDLL(None).system(b'echo escaped > {}')\n", preamble, outside.display()),
        format!("{}ctypes.pythonapi.system(b'echo escaped > {}')\n", preamble, outside.display()),
    ];

    for code in attempts {
        let result = engine.execute(ExecutionRequest::new(code, Language::Python));
        assert_capability_denied(&result);
        assert!(result.stderr().contains("capability denied: native_code"), "{}", result.stderr());
        assert!(!outside.exists());
    }
}

#[test]
fn test_empty_source() {
    let (engine, _root) = engine();

    for (language, tool) in [(Language::Python, "python3"), (Language::JavaScript, "node")] {
        if !have(tool) {
            continue;
        }
        let result = engine.execute(ExecutionRequest::new("", language));
        assert_eq!(result.status(), ExecutionStatus::Completed, "{}: {:?}", language, result);
        assert_eq!(result.stdout(), "");
        assert_eq!(result.exit_code(), Some(0));
    }

    if have("g++") {
        // No main(): the linker rejects it
        let result = engine.execute(ExecutionRequest::new("", Language::Cpp));
        assert_eq!(result.status(), ExecutionStatus::Error, "{:?}", result);
        assert_eq!(result.error_kind(), Some(ErrorKind::CompileError));
        assert!(!result.ran_stage(StageKind::Run));
    }

    if have("javac") {
        // Compiles to nothing, so the launcher finds no Main class
        let result = engine.execute(ExecutionRequest::new("", Language::Java));
        assert_eq!(result.status(), ExecutionStatus::Error, "{:?}", result);
        assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeError));
    }
    assert_eq!(leftover_workspaces(&engine), 0);
}

#[test]
fn test_javascript_child_process_is_denied() {
    if !have("node") {
        return;
    }
    let (engine, _root) = engine();
    let result = engine.execute(ExecutionRequest::new(
        "const { execSync } = require('child_process');\nconsole.log(String(execSync('echo escaped')));\n",
        Language::JavaScript,
    ));

    assert_capability_denied(&result);
    assert!(!result.stdout().contains("escaped"));
    if javascript::detect_node_major("node").is_some_and(|major| major >= 20) {
        assert!(result.stderr().contains("ERR_ACCESS_DENIED"), "{}", result.stderr());
    }
}

#[test]
fn test_javascript_network_is_denied() {
    if !have("node") {
        return;
    }
    let (engine, _root) = engine();
    let result = engine.execute(ExecutionRequest::new(
        "require('net').connect(9, '127.0.0.1');\n",
        Language::JavaScript,
    ));

    assert_capability_denied(&result);
}

#[test]
fn test_cpp_capabilities_are_enforced() {
    if !have("g++") {
        return;
    }
    let (engine, root) = engine();
    let outside = root.path().join("escaped");

    let spawn = format!(
        "#include <cstdlib>\nint main() {{\n    std::system(\"echo escaped > {}\");\n    return 0;\n}}\n",
        outside.display()
    );
    let result = engine.execute(ExecutionRequest::new(spawn, Language::Cpp));
    assert_capability_denied(&result);
    assert!(!outside.exists());

    let write = format!(
        "#include <cstdio>\nint main() {{\n    std::FILE* f = std::fopen(\"{}\", \"w\");\n    if (!f) {{ std::puts(\"refused\"); return 0; }}\n    std::fputs(\"escaped\", f);\n    std::fclose(f);\n    return 0;\n}}\n",
        outside.display()
    );
    let result = engine.execute(ExecutionRequest::new(write, Language::Cpp));
    assert_eq!(result.status(), ExecutionStatus::Completed, "{:?}", result);
    assert_eq!(result.stdout().trim_end(), "refused");
    assert!(!outside.exists());
}

#[test]
fn test_memory_exhaustion_every_language() {
    let (engine, _root) = engine();
    let hogs = [
        (
            Language::JavaScript,
            "node",
            "const held = [];\nfor (let i = 0; i < 10; i++) {\n    held.push(Buffer.alloc(100 * 1024 * 1024, 1));\n}\nconsole.log('allocated', held.length);\n",
        ),
        (
            Language::Java,
            "javac",
            "public class Main {\n    public static void main(String[] args) {\n        long[] held = new long[1 << 28];\n        System.out.println(held.length);\n    }\n}\n",
        ),
        (
            Language::Cpp,
            "g++",
            "#include <iostream>\n#include <vector>\nint main() {\n    std::vector<char> held(8ULL << 30, 1);\n    std::cout << int(held[12345]) << std::endl;\n}\n",
        ),
    ];

    for (language, tool, code) in hogs {
        if !have(tool) {
            continue;
        }
        let request = ExecutionRequest::new(code, language).with_limits(memory_mb(128));
        let result = engine.execute(request);
        assert_eq!(result.status(), ExecutionStatus::Error, "{}: {:?}", language, result);
        assert_eq!(
            result.error_kind(),
            Some(ErrorKind::ResourceLimitExceeded),
            "{}: {}",
            language,
            result.stderr()
        );
        assert_eq!(result.stdout(), "");
    }
}

#[test]
fn test_compile_error_leaves_no_artifact() {
    let registry = PolicyRegistry::builtin();
    let dir = TempDir::new().unwrap();
    let manager = WorkspaceManager::new(dir.path().join("workspaces")).unwrap();
    let supervisor = Supervisor::new(Duration::from_millis(200), Duration::from_secs(2));
    let adapters: [(&dyn LanguageAdapter, &str, &str, &str); 2] = [
        (
            &java::JavaAdapter,
            "javac",
            "public class Main {\n    public static void main(String[] args) {\n        int x = \"text\";\n    }\n}\n",
            "Main.class",
        ),
        (
            &cpp::CppAdapter,
            "g++",
            "int main() { return undefined_name; }\n",
            cpp::ARTIFACT,
        ),
    ];

    for (adapter, tool, code, artifact) in adapters {
        if !have(tool) {
            continue;
        }
        let policy = registry.resolve(adapter.language()).unwrap();
        let workspace = manager
            .acquire(&format!("artifact-{}", adapter.language()))
            .unwrap();
        let steps = adapter
            .prepare(code, &policy, &workspace, &policy.default_limits)
            .unwrap();
        let outcome = supervisor
            .run(&steps, &policy, &policy.default_limits, &CancelToken::new())
            .unwrap();

        assert!(outcome.failed_compile().is_some(), "{}", tool);
        assert_eq!(outcome.steps.len(), 1);
        assert!(!workspace.path().join(artifact).exists(), "{} left {}", tool, artifact);
        manager.release(workspace).unwrap();
    }
}
