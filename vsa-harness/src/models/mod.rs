pub mod change_record;
pub mod job_link;
