//! This module contains constants that are needed throughout the codebase.

/// The decision code recorded on an edge that enters a called method.
pub const CALL_DECISION: i32 = -2;

/// The decision code recorded on an edge that returns from a method to its
/// caller.
pub const RETURN_DECISION: i32 = -1;

/// The default maximum number of times that a single path may visit any one
/// instruction before the state is dropped.
pub const DEFAULT_VISITS_PER_INSTRUCTION: u32 = 10;

/// The default maximum length of the decision path for any explored state.
pub const DEFAULT_MAXIMUM_PATH_LENGTH: usize = 3_500;

/// The default maximum number of states that the explorer will take from the
/// frontier for a single method.
pub const DEFAULT_MAXIMUM_STATES: usize = 10_000;

/// The default maximum depth of the symbolic call stack.
pub const DEFAULT_MAXIMUM_CALL_DEPTH: usize = 32;

/// The default wall-clock budget for exploring a single method, in
/// milliseconds.
pub const DEFAULT_EXPLORATION_BUDGET_MS: u64 = 60_000;

/// The default seed used by the random path selector.
pub const DEFAULT_SELECTOR_SEED: u64 = 42;

/// The default number of distinct concrete values a symbolic array index or
/// length is concretised to.
pub const DEFAULT_CONCRETISATION_WIDTH: usize = 3;

/// The default number of loop iterations the generator will wait before
/// polling the watchdog.
pub const DEFAULT_WATCHDOG_POLL_LOOP_ITERATIONS: usize = 100;

/// The default timeout for a single concrete invocation in the sandbox, in
/// milliseconds.
pub const DEFAULT_CONCRETE_TIMEOUT_MS: u64 = 1_000;

/// The default time allowed for a freshly spawned sandbox process to answer
/// the program load request, in milliseconds.
pub const DEFAULT_SANDBOX_STARTUP_TIMEOUT_MS: u64 = 10_000;

/// The time granted to a sandbox process to exit on its own after a shutdown
/// request before it is killed, in milliseconds.
pub const SANDBOX_SHUTDOWN_GRACE_MS: u64 = 500;

/// The name of the sandbox executable, looked up on the `PATH` unless
/// configured otherwise.
pub const SANDBOX_EXECUTABLE: &str = "stg-sandbox";

/// The environment variables passed through to the sandbox process.
pub const SANDBOX_ENVIRONMENT: [&str; 2] = ["RUST_LOG", "RUST_BACKTRACE"];

/// The default maximum interpreter frame depth inside the sandbox.
pub const DEFAULT_SANDBOX_MAXIMUM_FRAMES: usize = 512;

/// The default maximum number of heap objects a single concrete invocation may
/// allocate.
pub const DEFAULT_SANDBOX_MAXIMUM_HEAP_OBJECTS: usize = 100_000;

/// The default maximum number of sandbox processes in a pool.
pub const DEFAULT_SANDBOX_POOL_SIZE: usize = 4;

/// The default number of search nodes the bounded solver will visit before
/// giving up with an unknown result.
pub const DEFAULT_SOLVER_NODE_LIMIT: usize = 200_000;

/// The smallest integer value that the bounded solver will ever propose.
pub const SOLVER_INT_MIN: i64 = i32::MIN as i64;

/// The largest integer value that the bounded solver will ever propose.
pub const SOLVER_INT_MAX: i64 = i32::MAX as i64;

/// The name of the root class of the class hierarchy.
pub const OBJECT_CLASS: &str = "java.lang.Object";

/// The name of the root class of everything that can be thrown.
pub const THROWABLE_CLASS: &str = "java.lang.Throwable";

/// The name of the class of unchecked runtime exceptions.
pub const RUNTIME_EXCEPTION_CLASS: &str = "java.lang.RuntimeException";

/// The name of the class thrown on integer division by zero.
pub const ARITHMETIC_EXCEPTION_CLASS: &str = "java.lang.ArithmeticException";

/// The name of the class thrown on dereferencing a null reference.
pub const NULL_POINTER_EXCEPTION_CLASS: &str = "java.lang.NullPointerException";

/// The name of the class thrown on out-of-bounds array accesses.
pub const INDEX_OUT_OF_BOUNDS_CLASS: &str = "java.lang.ArrayIndexOutOfBoundsException";

/// The name of the class thrown on allocating an array of negative length.
pub const NEGATIVE_ARRAY_SIZE_CLASS: &str = "java.lang.NegativeArraySizeException";

/// The name of the class thrown when an argument is rejected by a native.
pub const ILLEGAL_ARGUMENT_CLASS: &str = "java.lang.IllegalArgumentException";

/// The name of the error raised when the frame limit is exceeded.
pub const STACK_OVERFLOW_CLASS: &str = "java.lang.StackOverflowError";

/// The name of the error raised when the heap limit is exceeded.
pub const OUT_OF_MEMORY_CLASS: &str = "java.lang.OutOfMemoryError";

/// The name of the pseudo-random number generator class.
pub const RANDOM_CLASS: &str = "java.util.Random";

/// The name of the class holding the system clock.
pub const SYSTEM_CLASS: &str = "java.lang.System";

/// The signature of the system clock method.
pub const CURRENT_TIME_SIGNATURE: &str = "java.lang.System.currentTimeMillis()";

/// The name given to constructors.
pub const CONSTRUCTOR_NAME: &str = "<init>";

/// The name given to finalizers.
pub const FINALIZER_NAME: &str = "finalize";

/// The package prefix of the runtime library classes.
pub const RUNTIME_PACKAGE: &str = "java.";
