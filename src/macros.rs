// src/macros.rs
#[macro_export]
macro_rules! fault {
    ($name:expr, $($arg:tt)*) => {
        ::std::rc::Rc::new($crate::Fault::new($name, ::std::format!($($arg)*)))
    };
}

#[macro_export]
macro_rules! all_of {
    ($($v:expr),+ $(,)?) => {
        $crate::Promise::all(::std::vec![$($crate::Value::from($v)),+])
    };
}
