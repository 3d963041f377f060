use super::*;
use crate::linker::link;
use crate::optimizer::optimize;
use crate::parser::Parser;
use mcbcore::value::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Clone)]
struct Sink(Rc<RefCell<Vec<u8>>>);

impl std::io::Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capture(sys: &mut System) -> Rc<RefCell<Vec<u8>>> {
    let buf = Rc::new(RefCell::new(Vec::new()));
    sys.out = Box::new(Sink(buf.clone()));
    sys.eol = b"\n".to_vec();
    buf
}

fn build(src: &str) -> Result<(System, Rc<RefCell<Vec<u8>>>), Box<dyn std::error::Error>> {
    let mut sys = System::new();
    let buf = capture(&mut sys);
    sys.source_from(src);
    let tables = Parser::new().parse_all(&mut sys)?;
    link(&mut sys, &tables)?;
    Ok((sys, buf))
}

fn run_capture(src: &str) -> Result<String, Box<dyn std::error::Error>> {
    let (mut sys, buf) = build(src)?;
    optimize(&mut sys)?;
    let mut exec = Exec::new();
    exec.run(&mut sys)?;
    let text = String::from_utf8(buf.borrow().clone())?;
    Ok(text)
}

fn run_err(src: &str) -> RuntimeError {
    let (mut sys, _buf) = build(src).expect("program must compile");
    let mut exec = Exec::new();
    match exec.run(&mut sys) {
        Ok(()) => panic!("expected a runtime error for {:?}", src),
        Err(err) => err,
    }
}

#[test]
fn print_arithmetic() -> Result<(), Box<dyn std::error::Error>> {
    assert_eq!(run_capture("PRINT 1+2;")?, "3");
    assert_eq!(run_capture("PRINT 2*3+4;")?, "10");
    assert_eq!(run_capture("PRINT 2+3*4;")?, "14");
    assert_eq!(run_capture("PRINT (2+3)*4;")?, "20");
    Ok(())
}

#[test]
fn do_while_loop() -> Result<(), Box<dyn std::error::Error>> {
    let src = "DIM I=0\nDO WHILE I<3\nPRINT I;\nI=I+1\nLOOP\nEND\n";
    assert_eq!(run_capture(src)?, "012");

    let unsemi = "DIM I=0\nDO WHILE I<3\nPRINT I\nI=I+1\nLOOP\nEND\n";
    assert_eq!(run_capture(unsemi)?, "0\n1\n2\n");
    Ok(())
}

#[test]
fn do_until_tail_condition() -> Result<(), Box<dyn std::error::Error>> {
    let src = "DIM I=0\nDO\nI=I+1\nLOOP UNTIL I>=3\nPRINT I;\nEND\n";
    assert_eq!(run_capture(src)?, "3");
    Ok(())
}

#[test]
fn for_loop() -> Result<(), Box<dyn std::error::Error>> {
    assert_eq!(run_capture("FOR I=1 TO 3\nPRINT I*I;\nNEXT\nEND\n")?, "149");
    assert_eq!(
        run_capture("FOR I=3 TO 1 STEP -1\nPRINT I;\nNEXT\nEND\n")?,
        "321"
    );
    // Zero iterations when start is already past the limit.
    assert_eq!(run_capture("FOR I=5 TO 1\nPRINT I;\nNEXT\nPRINT 9;\nEND\n")?, "9");
    Ok(())
}

#[test]
fn sub_call_returns_through_the_frame() -> Result<(), Box<dyn std::error::Error>> {
    let src = "SUB ADD(A,B)\nRETURN A+B\nEND SUB\nPRINT ADD(2,40);\nEND\n";
    assert_eq!(run_capture(src)?, "42");
    Ok(())
}

#[test]
fn sub_without_return_yields_zero() -> Result<(), Box<dyn std::error::Error>> {
    let src = "SUB NOP2(A)\nEND SUB\nPRINT NOP2(9);\nEND\n";
    assert_eq!(run_capture(src)?, "0");
    Ok(())
}

#[test]
fn sub_locals_live_in_their_own_frame() -> Result<(), Box<dyn std::error::Error>> {
    let src = "\
DIM X=1
SUB F()
DIM B(2)
B(1)=5
RETURN B(1)
END SUB
PRINT F(); X;
END
";
    assert_eq!(run_capture(src)?, "51");
    Ok(())
}

#[test]
fn array_store_and_load() -> Result<(), Box<dyn std::error::Error>> {
    let src = "DIM A(3)\nA(0)=10\nA(1)=20\nA(2)=30\nPRINT A(2);\nEND\n";
    assert_eq!(run_capture(src)?, "30");
    Ok(())
}

#[test]
fn array_read_out_of_bounds() {
    let src = "DIM A(3)\nPRINT A(3);\nEND\n";
    assert_eq!(run_err(src), RuntimeError::OutOfBounds);

    let store = "DIM A(3)\nA(3)=1\nEND\n";
    assert_eq!(run_err(store), RuntimeError::OutOfBounds);
}

#[test]
fn array_by_reference_parameter() -> Result<(), Box<dyn std::error::Error>> {
    let src = "\
DIM A(3)
SUB FILL(B(), V)
B(0)=V
B(1)=V+1
RETURN 0
END SUB
FILL(A, 7)
PRINT A(0); A(1);
END
";
    assert_eq!(run_capture(src)?, "78");
    Ok(())
}

#[test]
fn by_ref_bounds_check_uses_declared_dim() {
    let src = "\
DIM A(2)
SUB POKE(B())
B(2)=1
RETURN 0
END SUB
POKE(A)
END
";
    assert_eq!(run_err(src), RuntimeError::OutOfBounds);
}

#[test]
fn division_semantics() -> Result<(), Box<dyn std::error::Error>> {
    // DIV is always float, IDIV always integer.
    assert_eq!(run_capture("PRINT 7/2;")?, "3.5");
    assert_eq!(run_capture("PRINT 7\\2;")?, "3");
    assert_eq!(run_capture("PRINT 7 MOD 2;")?, "1");
    Ok(())
}

#[test]
fn zero_divisor_traps() {
    assert_eq!(run_err("PRINT 1/0;\n"), RuntimeError::DivZero);
    assert_eq!(run_err("PRINT 1\\0;\n"), RuntimeError::DivZero);
    assert_eq!(run_err("PRINT 1 MOD 0;\n"), RuntimeError::DivZero);
}

#[test]
fn comparisons_yield_basic_booleans() -> Result<(), Box<dyn std::error::Error>> {
    assert_eq!(run_capture("PRINT (2<3);")?, "-1");
    assert_eq!(run_capture("PRINT (2>3);")?, "0");
    assert_eq!(run_capture("PRINT (2=2);")?, "-1");
    assert_eq!(run_capture("PRINT (2<>2);")?, "0");
    assert_eq!(run_capture("PRINT (2<=2);")?, "-1");
    assert_eq!(run_capture("PRINT (2.5>2);")?, "-1");
    Ok(())
}

#[test]
fn bitwise_and_logic_operators() -> Result<(), Box<dyn std::error::Error>> {
    assert_eq!(run_capture("PRINT NOT TRUE;")?, "0");
    assert_eq!(run_capture("PRINT NOT FALSE;")?, "-1");
    assert_eq!(run_capture("PRINT (6 AND 3);")?, "2");
    assert_eq!(run_capture("PRINT (6 OR 3);")?, "7");
    assert_eq!(run_capture("PRINT (6 XOR 3);")?, "5");
    assert_eq!(run_capture("PRINT 1<<4;")?, "16");
    assert_eq!(run_capture("PRINT 16>>2;")?, "4");
    Ok(())
}

#[test]
fn power_and_unary_minus() -> Result<(), Box<dyn std::error::Error>> {
    assert_eq!(run_capture("PRINT 2^3;")?, "8");
    // Unary minus binds tighter than the power operator.
    assert_eq!(run_capture("PRINT -2^2;")?, "4");
    assert_eq!(run_capture("PRINT 2^-1;")?, "0.5");
    Ok(())
}

#[test]
fn integer_arithmetic_iff_both_integer() -> Result<(), Box<dyn std::error::Error>> {
    assert_eq!(run_capture("PRINT 1+2.5;")?, "3.5");
    assert_eq!(run_capture("PRINT 2*2.5;")?, "5");
    Ok(())
}

#[test]
fn strings_print_their_pool_bytes() -> Result<(), Box<dyn std::error::Error>> {
    assert_eq!(
        run_capture("PRINT \"Hello, \"; \"World\";")?,
        "Hello, World"
    );
    assert_eq!(run_capture("PRINT \"a\"\n")?, "a\n");
    Ok(())
}

#[test]
fn if_chain_picks_one_branch() -> Result<(), Box<dyn std::error::Error>> {
    let src = "\
DIM I=2
IF I=1 THEN
PRINT \"one\";
ELSEIF I=2 THEN
PRINT \"two\";
ELSE
PRINT \"many\";
END IF
END
";
    assert_eq!(run_capture(src)?, "two");
    assert_eq!(run_capture(&src.replace("I=2\n", "I=9\n"))?, "many");
    Ok(())
}

#[test]
fn single_line_if_skips_its_body() -> Result<(), Box<dyn std::error::Error>> {
    assert_eq!(run_capture("IF 0 THEN PRINT 1;\nPRINT 2;\nEND\n")?, "2");
    assert_eq!(run_capture("IF 1 THEN PRINT 1;\nPRINT 2;\nEND\n")?, "12");
    Ok(())
}

#[test]
fn exit_for_leaves_a_clean_stack() -> Result<(), Box<dyn std::error::Error>> {
    let src = "\
FOR I=1 TO 10
IF I>3 THEN EXIT FOR
PRINT I;
NEXT
PRINT 0;
END
";
    assert_eq!(run_capture(src)?, "1230");
    Ok(())
}

#[test]
fn exit_do_pops_iteration_locals() -> Result<(), Box<dyn std::error::Error>> {
    let src = "\
DIM I=0
DO
DIM J=I*2
IF J>=4 THEN EXIT DO
I=I+1
LOOP
PRINT I;
END
";
    assert_eq!(run_capture(src)?, "2");
    Ok(())
}

#[test]
fn goto_and_labels() -> Result<(), Box<dyn std::error::Error>> {
    let src = "\
DIM I=0
again:
I=I+1
IF I<3 THEN GOTO again
PRINT I;
END
";
    assert_eq!(run_capture(src)?, "3");
    Ok(())
}

/// The peephole pass must not change observable output.
#[test]
fn optimizer_preserves_output() -> Result<(), Box<dyn std::error::Error>> {
    let src = "\
DIM I=0
hop:
I=I+1
IF I<3 THEN GOTO hop
GOTO out
PRINT 99;
out:
PRINT I;
END
";
    let (mut plain, plain_buf) = build(src)?;
    Exec::new().run(&mut plain)?;

    let (mut tuned, tuned_buf) = build(src)?;
    optimize(&mut tuned)?;
    Exec::new().run(&mut tuned)?;

    assert_eq!(&*plain_buf.borrow(), &*tuned_buf.borrow());
    Ok(())
}

#[test]
fn registers_read_and_write() -> Result<(), Box<dyn std::error::Error>> {
    let mut sys = System::new();
    let buf = capture(&mut sys);
    let cell = Rc::new(Cell::new(0i32));
    let wcell = cell.clone();
    let rcell = cell.clone();
    sys.add_register(
        "val",
        Some(Box::new(move || Ok(Value::Int(rcell.get())))),
        Some(Box::new(move |value| {
            wcell.set(value.as_int());
            Ok(())
        })),
    )?;
    sys.source_from("$VAL = 41\nPRINT $val + 1;\nEND\n");
    let tables = Parser::new().parse_all(&mut sys)?;
    link(&mut sys, &tables)?;
    Exec::new().run(&mut sys)?;
    assert_eq!(cell.get(), 41);
    assert_eq!(String::from_utf8(buf.borrow().clone())?, "42");
    Ok(())
}

#[test]
fn write_only_register_rejects_reads() -> Result<(), Box<dyn std::error::Error>> {
    let mut sys = System::new();
    capture(&mut sys);
    sys.add_register("sink", None, Some(Box::new(|_| Ok(()))))?;
    sys.source_from("PRINT $sink;\nEND\n");
    let tables = Parser::new().parse_all(&mut sys)?;
    link(&mut sys, &tables)?;
    let err = Exec::new().run(&mut sys).unwrap_err();
    assert_eq!(err, RuntimeError::RegRead);

    let mut sys = System::new();
    capture(&mut sys);
    sys.add_register("probe", Some(Box::new(|| Ok(Value::Int(0)))), None)?;
    sys.source_from("$probe = 1\nEND\n");
    let tables = Parser::new().parse_all(&mut sys)?;
    link(&mut sys, &tables)?;
    let err = Exec::new().run(&mut sys).unwrap_err();
    assert_eq!(err, RuntimeError::RegWrite);
    Ok(())
}

#[test]
fn services_receive_arguments_and_return_a_value() -> Result<(), Box<dyn std::error::Error>> {
    let mut sys = System::new();
    let buf = capture(&mut sys);
    sys.add_service(
        "max2",
        2,
        Box::new(|call| {
            let a = call.arg(0)?.as_int();
            let b = call.arg(1)?.as_int();
            Ok(Value::Int(a.max(b)))
        }),
    )?;
    sys.source_from("PRINT MAX2(3, 11);\nEND\n");
    let tables = Parser::new().parse_all(&mut sys)?;
    link(&mut sys, &tables)?;
    Exec::new().run(&mut sys)?;
    assert_eq!(String::from_utf8(buf.borrow().clone())?, "11");
    Ok(())
}

#[test]
fn service_can_write_through_pointer_arguments() -> Result<(), Box<dyn std::error::Error>> {
    let mut sys = System::new();
    let buf = capture(&mut sys);
    sys.add_service(
        "seed",
        1,
        Box::new(|call| {
            let ptr = call.arg(0)?;
            call.store(ptr, 0, Value::Int(9))?;
            call.store(ptr, 1, Value::Int(8))?;
            Ok(Value::Int(0))
        }),
    )?;
    sys.source_from("DIM A(2)\nSEED(A)\nPRINT A(0); A(1);\nEND\n");
    let tables = Parser::new().parse_all(&mut sys)?;
    link(&mut sys, &tables)?;
    Exec::new().run(&mut sys)?;
    assert_eq!(String::from_utf8(buf.borrow().clone())?, "98");
    Ok(())
}

#[test]
fn runaway_recursion_overflows_the_stack() {
    let src = "\
SUB R(N)
RETURN R(N+1)
END SUB
PRINT R(0);
END
";
    assert_eq!(run_err(src), RuntimeError::StackOverflow);
}

#[test]
fn float_rounding_on_int_contexts() -> Result<(), Box<dyn std::error::Error>> {
    // Array indices coerce with the +0.5 rounding rule.
    let src = "DIM A(3)\nA(1.6)=5\nPRINT A(2);\nEND\n";
    assert_eq!(run_capture(src)?, "5");
    Ok(())
}

#[test]
fn step_resumes_exactly_where_it_left() -> Result<(), Box<dyn std::error::Error>> {
    let (mut sys, buf) = build("PRINT 1;\nPRINT 2;\nEND\n")?;
    let mut exec = Exec::new();
    // Drive manually, one instruction at a time.
    let mut steps = 0;
    loop {
        match exec.step(&mut sys)? {
            Step::More => steps += 1,
            Step::End => break,
        }
        assert!(steps < 100);
    }
    assert_eq!(String::from_utf8(buf.borrow().clone())?, "12");
    assert_eq!(exec.sp(), 0);
    Ok(())
}

#[test]
fn task_suspends_on_sleep_and_preserves_state() -> Result<(), Box<dyn std::error::Error>> {
    let mut sys = System::new();
    let buf = capture(&mut sys);
    let sleep = sys.sleep.clone();
    sys.add_service(
        "sleep",
        1,
        Box::new(move |call| {
            sleep.set(call.arg(0)?.as_int().max(0) as u32);
            Ok(Value::Int(0))
        }),
    )?;
    sys.source_from("SLEEP(60000)\nPRINT 1;\nEND\n");
    let tables = Parser::new().parse_all(&mut sys)?;
    link(&mut sys, &tables)?;

    let mut exec = Exec::new();
    // First slice runs into the sleep and suspends.
    assert!(exec.task(&mut sys, 5)?);
    assert!(buf.borrow().is_empty());
    // The program is still asleep, the slice returns immediately.
    assert!(exec.task(&mut sys, 5)?);
    assert!(buf.borrow().is_empty());
    Ok(())
}

#[test]
fn task_slices_a_busy_loop() -> Result<(), Box<dyn std::error::Error>> {
    let (mut sys, _buf) = build("spin:\nGOTO spin\n")?;
    let mut exec = Exec::new();
    assert!(exec.task(&mut sys, 1)?);
    assert!(exec.task(&mut sys, 1)?);
    Ok(())
}

#[test]
fn end_with_unbalanced_gosub_frames_is_detectable() -> Result<(), Box<dyn std::error::Error>> {
    // A sub that ENDs inside its body terminates normally but leaves
    // its frame on the stack; the final sp shows the leak.
    let src = "SUB STOPPER()\nEND\nEND SUB\nSTOPPER()\nEND\n";
    let (mut sys, _buf) = build(src)?;
    let mut exec = Exec::new();
    exec.run(&mut sys)?;
    assert!(exec.sp() > 0);
    Ok(())
}
